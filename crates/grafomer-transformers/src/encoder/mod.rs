//! Bidirectional (post-norm) encoder layer.

use anyhow::Result;
use ndarray::{Array2, Array3};

use crate::attention::MultiHeadAttention;
use crate::feedforward::FeedForward;
use crate::normalization::LayerNorm;

/// Result of an encoder stack forward, with optional per-layer history.
pub struct EncoderOutput {
    pub last_hidden_state: Array3<f32>,
    /// Input to each layer plus the final output, when requested.
    pub hidden_states: Option<Vec<Array3<f32>>>,
}

/// A post-norm encoder layer (BERT / BART style):
/// `x -> LN(x + Attn(x)) -> LN(.. + FFN(..))`.
#[derive(Debug)]
pub struct EncoderLayer {
    pub self_attn: MultiHeadAttention,
    pub self_attn_layer_norm: LayerNorm,
    pub feedforward: FeedForward,
    pub ffn_layer_norm: LayerNorm,
}

impl EncoderLayer {
    pub fn forward(
        &self,
        hidden: &Array3<f32>,
        attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let residual = hidden.clone();
        let (attn_out, _, _) = self
            .self_attn
            .forward_with_cache(hidden, None, attention_mask, false, None)?;
        let hidden = self.self_attn_layer_norm.forward_3d(&(residual + attn_out));

        let residual = hidden.clone();
        let ffn_out = self.feedforward.forward(&hidden)?;
        let hidden = self.ffn_layer_norm.forward_3d(&(residual + ffn_out));

        Ok(hidden)
    }
}

/// Runs a stack of encoder layers.
pub fn forward_encoder_layers(
    layers: &[EncoderLayer],
    hidden_states: &Array3<f32>,
    attention_mask: Option<&Array2<f32>>,
    collect_hidden_states: bool,
) -> Result<EncoderOutput> {
    let mut hidden = hidden_states.clone();
    let mut all_hidden = collect_hidden_states.then(Vec::new);

    for layer in layers {
        if let Some(ref mut history) = all_hidden {
            history.push(hidden.clone());
        }
        hidden = layer.forward(&hidden, attention_mask)?;
    }
    if let Some(ref mut history) = all_hidden {
        history.push(hidden.clone());
    }

    Ok(EncoderOutput {
        last_hidden_state: hidden,
        hidden_states: all_hidden,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::Activation;
    use crate::linear_layer::LinearLayer;
    use ndarray::Array2;

    fn mock_layer(hidden_size: usize, intermediate_size: usize, num_heads: usize) -> EncoderLayer {
        let proj = Array2::from_shape_fn((hidden_size, hidden_size), |(i, j)| {
            if i == j {
                1.1
            } else {
                (i + j) as f32 * 0.001
            }
        });

        EncoderLayer {
            self_attn: MultiHeadAttention::new(
                hidden_size,
                num_heads,
                LinearLayer::from(proj.clone()),
                LinearLayer::from(proj.clone()),
                LinearLayer::from(proj.clone()),
                LinearLayer::from(proj),
            )
            .unwrap(),
            self_attn_layer_norm: LayerNorm::identity(hidden_size, 1e-5),
            feedforward: FeedForward::xavier(hidden_size, intermediate_size, Activation::Gelu),
            ffn_layer_norm: LayerNorm::identity(hidden_size, 1e-5),
        }
    }

    #[test]
    fn test_layer_preserves_shape_and_normalizes() {
        let layer = mock_layer(64, 128, 4);
        let hidden = Array3::<f32>::ones((2, 5, 64));
        let mask = Array2::<f32>::ones((2, 5));

        let out = layer.forward(&hidden, Some(&mask)).unwrap();

        assert_eq!(out.dim(), (2, 5, 64));
        // Post-norm output is normalized per position.
        assert!(out.mean().unwrap().abs() < 1e-5);
    }

    #[test]
    fn test_stack_collects_hidden_states_on_request() {
        let layers: Vec<_> = (0..3).map(|_| mock_layer(16, 32, 2)).collect();
        let hidden = Array3::<f32>::ones((1, 4, 16));

        let with = forward_encoder_layers(&layers, &hidden, None, true).unwrap();
        let without = forward_encoder_layers(&layers, &hidden, None, false).unwrap();

        assert_eq!(with.hidden_states.as_ref().unwrap().len(), 4);
        assert!(without.hidden_states.is_none());
        assert_eq!(
            with.last_hidden_state.dim(),
            without.last_hidden_state.dim()
        );
    }
}
