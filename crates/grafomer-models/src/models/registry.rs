//! Explicit model-family registry.
//!
//! Maps a family identifier (`"bert"`, `"gpt2"`) to a typed construction
//! function, resolved once at configuration-load time. New families are
//! added with [`ModelRegistry::register_encoder`] /
//! [`ModelRegistry::register_decoder`].

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

use grafomer_transformers::error::ConfigurationError;

use crate::models::bert::BertEncoderModel;
use crate::models::gpt2::Gpt2DecoderModel;
use crate::models::{PretrainedDecoder, PretrainedEncoder};

pub type EncoderBuilder = fn(&Path) -> Result<Box<dyn PretrainedEncoder>>;
pub type DecoderBuilder = fn(&Path) -> Result<Box<dyn PretrainedDecoder>>;

pub struct ModelRegistry {
    encoders: HashMap<String, EncoderBuilder>,
    decoders: HashMap<String, DecoderBuilder>,
}

fn build_bert(path: &Path) -> Result<Box<dyn PretrainedEncoder>> {
    Ok(Box::new(BertEncoderModel::from_pretrained(path)?))
}

fn build_gpt2(path: &Path) -> Result<Box<dyn PretrainedDecoder>> {
    Ok(Box::new(Gpt2DecoderModel::from_pretrained(path)?))
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            encoders: HashMap::new(),
            decoders: HashMap::new(),
        }
    }

    /// The built-in families.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_encoder("bert", build_bert);
        registry.register_decoder("gpt2", build_gpt2);
        registry
    }

    pub fn register_encoder(&mut self, family: &str, builder: EncoderBuilder) {
        self.encoders.insert(family.to_string(), builder);
    }

    pub fn register_decoder(&mut self, family: &str, builder: DecoderBuilder) {
        self.decoders.insert(family.to_string(), builder);
    }

    pub fn load_encoder(&self, family: &str, path: &Path) -> Result<Box<dyn PretrainedEncoder>> {
        let builder = self.encoders.get(family).ok_or_else(|| {
            ConfigurationError::Invalid(format!("unknown encoder family '{}'", family))
        })?;
        builder(path)
    }

    pub fn load_decoder(&self, family: &str, path: &Path) -> Result<Box<dyn PretrainedDecoder>> {
        let builder = self.decoders.get(family).ok_or_else(|| {
            ConfigurationError::Invalid(format!("unknown decoder family '{}'", family))
        })?;
        builder(path)
    }

    pub fn encoder_families(&self) -> Vec<&str> {
        self.encoders.keys().map(|s| s.as_str()).collect()
    }

    pub fn decoder_families(&self) -> Vec<&str> {
        self.decoders.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_register_known_families() {
        let registry = ModelRegistry::with_defaults();
        assert!(registry.encoder_families().contains(&"bert"));
        assert!(registry.decoder_families().contains(&"gpt2"));
    }

    #[test]
    fn test_unknown_family_is_configuration_error() {
        let registry = ModelRegistry::with_defaults();
        let err = registry
            .load_encoder("t5", Path::new("/nonexistent"))
            .unwrap_err();
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }

    #[test]
    fn test_custom_family_registration() {
        let mut registry = ModelRegistry::empty();
        assert!(registry.encoder_families().is_empty());

        registry.register_encoder("bert", super::build_bert);
        assert_eq!(registry.encoder_families(), vec!["bert"]);
    }
}
