use grafomer_transformers::activations::Activation;
use serde::Deserialize;

fn default_layer_norm_eps() -> f32 {
    1e-12
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_model_type() -> String {
    "bert".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
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

    #[serde(alias = "hidden_act")]
    pub hidden_act: Option<String>,

    #[serde(default = "default_model_type")]
    pub model_type: String,
}

impl BertConfig {
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

    /// Tensor name for a per-layer parameter, e.g.
    /// `encoder.layer.3.attention.self.query.weight`.
    pub fn layer_name(&self, layer: usize, suffix: &str) -> String {
        format!("encoder.layer.{}.{}", layer, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BERT_BASE_CONFIG_JSON: &str = r#"{
        "vocab_size": 30522,
        "hidden_size": 768,
        "num_hidden_layers": 12,
        "num_attention_heads": 12,
        "intermediate_size": 3072,
        "max_position_embeddings": 512,
        "type_vocab_size": 2,
        "hidden_act": "gelu",
        "model_type": "bert"
    }"#;

    #[test]
    fn test_bert_base_config() {
        let config = BertConfig::from_json(BERT_BASE_CONFIG_JSON).unwrap();

        assert_eq!(config.hidden_size, 768);
        assert_eq!(config.num_hidden_layers, 12);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.layer_norm_eps, 1e-12);
        assert_eq!(config.activation(), Activation::Gelu);
        assert_eq!(
            config.layer_name(5, "attention.self.query.weight"),
            "encoder.layer.5.attention.self.query.weight"
        );
    }
}
