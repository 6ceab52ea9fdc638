use grafomer_transformers::activations::Activation;
use serde::Deserialize;

fn default_layer_norm_eps() -> f32 {
    1e-12
}

fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_initializer_range() -> f32 {
    0.02
}

/// A BERT-shaped student stack. `num_hidden_layers` counts *student*
/// layers; the teacher's layer count is discovered from the teacher
/// context at construction time.
#[derive(Debug, Clone, Deserialize)]
pub struct StudentEncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,

    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f32,

    #[serde(alias = "hidden_act")]
    pub hidden_act: Option<String>,
}

impl StudentEncoderConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn activation(&self) -> Activation {
        self.hidden_act
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Activation::Gelu)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// A GPT-2-shaped student stack.
#[derive(Debug, Clone, Deserialize)]
pub struct StudentDecoderConfig {
    pub vocab_size: usize,
    #[serde(alias = "n_positions")]
    pub n_ctx: usize,
    pub n_embd: usize,
    /// Number of *student* layers.
    pub n_layer: usize,
    pub n_head: usize,
    pub n_inner: Option<usize>,

    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f32,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f32,

    #[serde(alias = "activation_function")]
    pub activation_function: Option<String>,
}

impl StudentDecoderConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn intermediate_size(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    pub fn activation(&self) -> Activation {
        self.activation_function
            .as_ref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Activation::GeluNew)
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_config_defaults() {
        let config = StudentEncoderConfig::from_json(
            r#"{
                "vocab_size": 30522,
                "hidden_size": 768,
                "num_hidden_layers": 4,
                "num_attention_heads": 12,
                "intermediate_size": 3072,
                "max_position_embeddings": 512
            }"#,
        )
        .unwrap();

        assert_eq!(config.num_hidden_layers, 4);
        assert_eq!(config.layer_norm_eps, 1e-12);
        assert_eq!(config.initializer_range, 0.02);
        assert_eq!(config.activation(), Activation::Gelu);
    }

    #[test]
    fn test_decoder_config_defaults() {
        let config = StudentDecoderConfig::from_json(
            r#"{
                "vocab_size": 50257,
                "n_ctx": 1024,
                "n_embd": 768,
                "n_layer": 3,
                "n_head": 12
            }"#,
        )
        .unwrap();

        assert_eq!(config.intermediate_size(), 3072);
        assert_eq!(config.activation(), Activation::GeluNew);
        assert_eq!(config.head_dim(), 64);
    }
}
