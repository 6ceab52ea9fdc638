use grafomer_transformers::activations::Activation;
use serde::Deserialize;

fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

fn default_model_type() -> String {
    "gpt2".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    /// Maximum sequence length
    #[serde(alias = "n_positions")]
    pub n_ctx: usize,
    /// Hidden size
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    /// Inner FFN dimension; defaults to `4 * n_embd`
    pub n_inner: Option<usize>,

    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f32,

    #[serde(alias = "activation_function")]
    pub activation_function: Option<String>,

    #[serde(default = "default_model_type")]
    pub model_type: String,
}

impl Gpt2Config {
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

    /// Tensor name for a per-layer parameter, e.g. `h.4.attn.c_attn.weight`.
    pub fn layer_name(&self, layer: usize, suffix: &str) -> String {
        format!("h.{}.{}", layer, suffix)
    }
}
