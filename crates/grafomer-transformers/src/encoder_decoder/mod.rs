//! Decoder layer with cross-attention for encoder-decoder models.

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView3};

use crate::attention::MultiHeadAttention;
use crate::feedforward::FeedForward;
use crate::normalization::LayerNorm;

/// A post-norm decoder layer with causal self-attention, cross-attention to
/// encoder states, and a feed-forward block (BART style).
pub struct CrossDecoderLayer {
    pub self_attn: MultiHeadAttention,
    pub self_attn_layer_norm: LayerNorm,
    pub cross_attn: MultiHeadAttention,
    pub cross_attn_layer_norm: LayerNorm,
    pub feedforward: FeedForward,
    pub ffn_layer_norm: LayerNorm,
}

impl CrossDecoderLayer {
    /// Projects the encoder states through this layer's cross-attention K/V
    /// once per sequence; decoding steps then reuse the result.
    pub fn precompute_cross_kv(
        &self,
        encoder_hidden_states: &Array3<f32>,
    ) -> (Array3<f32>, Array3<f32>) {
        self.cross_attn.project_kv(encoder_hidden_states)
    }

    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        encoder_hidden_states: &Array3<f32>,
        self_mask: Option<&Array2<f32>>,
        cross_mask: Option<&Array2<f32>>,
        past_kv: Option<(ArrayView3<f32>, ArrayView3<f32>)>,
        cross_kv: Option<&(Array3<f32>, Array3<f32>)>,
    ) -> Result<(Array3<f32>, (Array3<f32>, Array3<f32>))> {
        // 1. Causal self-attention
        let residual = hidden_states.clone();
        let (attn_out, new_k, new_v) =
            self.self_attn
                .forward_with_cache(hidden_states, None, self_mask, true, past_kv)?;
        let hidden_states = self.self_attn_layer_norm.forward_3d(&(residual + attn_out));

        // 2. Cross-attention
        let residual = hidden_states.clone();
        let cross_out = if let Some((k_static, v_static)) = cross_kv {
            self.cross_attn
                .forward_precomputed(&hidden_states, k_static, v_static, cross_mask)?
        } else {
            let (k, v) = self.precompute_cross_kv(encoder_hidden_states);
            self.cross_attn
                .forward_precomputed(&hidden_states, &k, &v, cross_mask)?
        };
        let hidden_states = self
            .cross_attn_layer_norm
            .forward_3d(&(residual + cross_out));

        // 3. FFN
        let residual = hidden_states.clone();
        let ffn_out = self.feedforward.forward(&hidden_states)?;
        let hidden_states = self.ffn_layer_norm.forward_3d(&(residual + ffn_out));

        Ok((hidden_states, (new_k, new_v)))
    }
}
