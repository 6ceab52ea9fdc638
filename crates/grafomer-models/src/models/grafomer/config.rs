use grafomer_transformers::activations::Activation;
use serde::Deserialize;

fn default_bridge_width() -> usize {
    768
}

fn default_num_heads() -> usize {
    12
}

fn default_ffn_dim() -> usize {
    3072
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

fn default_activation() -> Activation {
    Activation::Gelu
}

/// Architecture of the graft bridge. All bridge parameters are freshly
/// initialized; nothing here refers to a checkpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GraftConfig {
    #[serde(alias = "num_enc_layer")]
    pub num_encoder_layers: usize,
    #[serde(alias = "num_dec_layer")]
    pub num_decoder_layers: usize,

    /// Internal width of the bridge; must equal the pretrained encoder's
    /// hidden size, since the bridge encoder refines its states directly.
    #[serde(default = "default_bridge_width", alias = "d_model")]
    pub bridge_width: usize,

    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_ffn_dim")]
    pub ffn_dim: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default = "default_activation")]
    pub activation: Activation,
}

/// One pretrained half: which registered family builds it, and where its
/// checkpoint lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    pub family: String,
    pub path: String,
}

/// Load-time configuration of a grafted model; immutable for the lifetime
/// of the instance.
#[derive(Debug, Clone, Deserialize)]
pub struct GrafomerConfig {
    pub encoder: ComponentConfig,
    pub decoder: ComponentConfig,
    pub decoder_start_token_id: u32,
    #[serde(alias = "graft_module_config")]
    pub graft: GraftConfig,
}

impl GrafomerConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
