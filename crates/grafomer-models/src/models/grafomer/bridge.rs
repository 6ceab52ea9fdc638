//! The graft bridge: a small trainable transformer inserted between two
//! frozen pretrained models.

use anyhow::Result;
use ndarray::{Array2, Array3};

use grafomer_transformers::attention::MultiHeadAttention;
use grafomer_transformers::encoder::EncoderLayer;
use grafomer_transformers::encoder_decoder::CrossDecoderLayer;
use grafomer_transformers::error::ConfigurationError;
use grafomer_transformers::feedforward::FeedForward;
use grafomer_transformers::linear_layer::LinearLayer;
use grafomer_transformers::normalization::LayerNorm;

use crate::models::grafomer::config::GraftConfig;

/// A learned residual correction between a frozen encoder's output and a
/// frozen decoder's hidden state.
///
/// The decoder hidden state is pooled down to the bridge width, the bridge's
/// own encoder layers refine the (same-width) pretrained encoder output, its
/// causal cross-decoder layers attend to that refinement, and the result is
/// pooled back up to the decoder width. With both pretrained halves frozen,
/// all task-specific capacity lives here.
pub struct GraftBridge {
    input_pooler: LinearLayer,
    encoder_layers: Vec<EncoderLayer>,
    decoder_layers: Vec<CrossDecoderLayer>,
    output_pooler: LinearLayer,
    bridge_width: usize,
}

fn xavier_attention(config: &GraftConfig) -> Result<MultiHeadAttention> {
    let w = config.bridge_width;
    MultiHeadAttention::new(
        w,
        config.num_heads,
        LinearLayer::xavier(w, w),
        LinearLayer::xavier(w, w),
        LinearLayer::xavier(w, w),
        LinearLayer::xavier(w, w),
    )
}

impl GraftBridge {
    /// `encoder_hidden_size` is the width of the pretrained encoder states
    /// the bridge will refine; it must equal the configured bridge width.
    /// `decoder_hidden_size` is reconciled by the input/output poolers.
    pub fn new(
        config: &GraftConfig,
        encoder_hidden_size: usize,
        decoder_hidden_size: usize,
    ) -> Result<Self> {
        if encoder_hidden_size != config.bridge_width {
            return Err(ConfigurationError::Invalid(format!(
                "bridge width {} does not match encoder hidden size {}; the bridge \
                 encoder operates directly on pretrained encoder states",
                config.bridge_width, encoder_hidden_size
            ))
            .into());
        }

        log::info!(
            "building graft bridge: {} encoder + {} decoder layers, width {}",
            config.num_encoder_layers,
            config.num_decoder_layers,
            config.bridge_width
        );

        let w = config.bridge_width;
        let mut encoder_layers = Vec::with_capacity(config.num_encoder_layers);
        for _ in 0..config.num_encoder_layers {
            encoder_layers.push(EncoderLayer {
                self_attn: xavier_attention(config)?,
                self_attn_layer_norm: LayerNorm::identity(w, config.layer_norm_eps),
                feedforward: FeedForward::xavier(w, config.ffn_dim, config.activation),
                ffn_layer_norm: LayerNorm::identity(w, config.layer_norm_eps),
            });
        }

        let mut decoder_layers = Vec::with_capacity(config.num_decoder_layers);
        for _ in 0..config.num_decoder_layers {
            decoder_layers.push(CrossDecoderLayer {
                self_attn: xavier_attention(config)?,
                self_attn_layer_norm: LayerNorm::identity(w, config.layer_norm_eps),
                cross_attn: xavier_attention(config)?,
                cross_attn_layer_norm: LayerNorm::identity(w, config.layer_norm_eps),
                feedforward: FeedForward::xavier(w, config.ffn_dim, config.activation),
                ffn_layer_norm: LayerNorm::identity(w, config.layer_norm_eps),
            });
        }

        Ok(Self {
            input_pooler: LinearLayer::xavier(w, decoder_hidden_size),
            encoder_layers,
            decoder_layers,
            output_pooler: LinearLayer::xavier(decoder_hidden_size, w),
            bridge_width: w,
        })
    }

    pub fn bridge_width(&self) -> usize {
        self.bridge_width
    }

    /// Returns a correction tensor shaped like `decoder_hidden_states`.
    pub fn forward(
        &self,
        encoder_hidden_states: &Array3<f32>,
        encoder_attention_mask: Option<&Array2<f32>>,
        decoder_hidden_states: &Array3<f32>,
        decoder_attention_mask: Option<&Array2<f32>>,
        cross_attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let mut bridge_hidden = self.input_pooler.forward(decoder_hidden_states);

        let mut refined_encoder = encoder_hidden_states.clone();
        for layer in &self.encoder_layers {
            refined_encoder = layer.forward(&refined_encoder, encoder_attention_mask)?;
        }

        for layer in &self.decoder_layers {
            let (next, _) = layer.forward(
                &bridge_hidden,
                &refined_encoder,
                decoder_attention_mask,
                cross_attention_mask,
                None,
                None,
            )?;
            bridge_hidden = next;
        }

        Ok(self.output_pooler.forward(&bridge_hidden))
    }
}
