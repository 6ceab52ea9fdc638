//! Attention-mask construction and application.
//!
//! Visibility masks are `[batch, key_len]` tensors of 1.0 (attend) / 0.0
//! (suppress). Masked score positions are overwritten with [`MASK_VALUE`]
//! before softmax.

use anyhow::{anyhow, Result};
use ndarray::{s, Array2, Array4, Axis, Zip};

pub const MASK_VALUE: f32 = -1e9;

/// Apply a padding mask to attention scores.
///
/// Masks positions where `mask[batch, key_pos] == 0`.
pub fn apply_padding_mask(mut scores: Array4<f32>, mask: &Array2<f32>) -> Result<Array4<f32>> {
    let (batch_size, num_heads, seq_q, seq_k) = scores.dim();

    if mask.shape()[0] != batch_size {
        return Err(anyhow!(
            "mask batch size {} doesn't match scores batch size {}",
            mask.shape()[0],
            batch_size
        ));
    }
    if mask.shape()[1] != seq_k {
        return Err(anyhow!(
            "mask sequence length {} doesn't match key sequence length {}",
            mask.shape()[1],
            seq_k
        ));
    }

    // Expand mask: [batch, seq_k] -> [batch, 1, 1, seq_k]
    let mask_expanded = mask.view().insert_axis(Axis(1)).insert_axis(Axis(1));

    if let Some(broadcast_mask) = mask_expanded.broadcast((batch_size, num_heads, seq_q, seq_k)) {
        Zip::from(&mut scores)
            .and(&broadcast_mask)
            .for_each(|s, &m| {
                if m == 0.0 {
                    *s = MASK_VALUE;
                }
            });
    }

    Ok(scores)
}

/// Apply a causal mask computed on the fly.
///
/// Position `i` may only attend to absolute positions `0..=cache_len + i`.
pub fn apply_causal_mask(scores: &mut Array4<f32>, cache_len: usize) {
    let (_, _, seq_q, seq_k) = scores.dim();
    for i in 0..seq_q {
        let query_pos = cache_len + i;
        for j in 0..seq_k {
            if j > query_pos {
                scores.slice_mut(s![.., .., i, j]).fill(MASK_VALUE);
            }
        }
    }
}

/// A fixed lower-triangular visibility buffer, built once for the maximum
/// position count and sliced per call to the current query/key window.
#[derive(Debug, Clone)]
pub struct CausalMask {
    tril: Array2<bool>,
}

impl CausalMask {
    pub fn new(max_positions: usize) -> Self {
        let tril = Array2::from_shape_fn((max_positions, max_positions), |(i, j)| j <= i);
        Self { tril }
    }

    pub fn max_positions(&self) -> usize {
        self.tril.shape()[0]
    }

    /// Overwrite future positions in `scores` with [`MASK_VALUE`], using the
    /// window of the buffer that corresponds to queries at absolute positions
    /// `cache_len..cache_len + seq_q` against keys `0..seq_k`.
    pub fn apply(&self, scores: &mut Array4<f32>, cache_len: usize) -> Result<()> {
        let (_, _, seq_q, seq_k) = scores.dim();
        let total = cache_len + seq_q;
        if total > self.max_positions() || seq_k > self.max_positions() {
            return Err(anyhow!(
                "sequence of length {} exceeds maximum position count {}",
                total.max(seq_k),
                self.max_positions()
            ));
        }

        let window = self.tril.slice(s![cache_len..total, 0..seq_k]);
        for i in 0..seq_q {
            for j in 0..seq_k {
                if !window[[i, j]] {
                    scores.slice_mut(s![.., .., i, j]).fill(MASK_VALUE);
                }
            }
        }
        Ok(())
    }
}

/// All positions visible. Returns `[batch_size, seq_len]` of 1.0.
pub fn create_full_attention_mask(batch_size: usize, seq_len: usize) -> Array2<f32> {
    Array2::ones((batch_size, seq_len))
}

/// Padding mask from token ids: `pad_token_id` positions become 0.0.
pub fn create_padding_mask_from_tokens(token_ids: &Array2<u32>, pad_token_id: u32) -> Array2<f32> {
    token_ids.mapv(|id| if id == pad_token_id { 0.0 } else { 1.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_apply_padding_mask() {
        let scores = Array4::<f32>::zeros((1, 2, 3, 4));
        let mask =
            Array2::from_shape_vec((1, 4), vec![1.0, 1.0, 0.0, 0.0]).unwrap();

        let masked = apply_padding_mask(scores, &mask).unwrap();

        for h in 0..2 {
            for q in 0..3 {
                assert_eq!(masked[[0, h, q, 0]], 0.0);
                assert_eq!(masked[[0, h, q, 1]], 0.0);
                assert_eq!(masked[[0, h, q, 2]], MASK_VALUE);
                assert_eq!(masked[[0, h, q, 3]], MASK_VALUE);
            }
        }
    }

    #[test]
    fn test_padding_mask_length_mismatch_errors() {
        let scores = Array4::<f32>::zeros((1, 1, 2, 4));
        let mask = Array2::ones((1, 3));
        assert!(apply_padding_mask(scores, &mask).is_err());
    }

    #[test]
    fn test_apply_causal_mask_no_cache() {
        let mut scores = Array4::<f32>::zeros((1, 1, 3, 3));
        apply_causal_mask(&mut scores, 0);

        assert_eq!(scores[[0, 0, 0, 0]], 0.0);
        assert_eq!(scores[[0, 0, 0, 1]], MASK_VALUE);
        assert_eq!(scores[[0, 0, 0, 2]], MASK_VALUE);
        assert_eq!(scores[[0, 0, 1, 2]], MASK_VALUE);
        assert_eq!(scores[[0, 0, 2, 2]], 0.0);
    }

    #[test]
    fn test_apply_causal_mask_with_cache() {
        // A single new query at absolute position 3 sees all 4 keys.
        let mut scores = Array4::<f32>::zeros((1, 1, 1, 4));
        apply_causal_mask(&mut scores, 3);
        assert!(scores.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_causal_buffer_matches_rolling_mask() {
        let buffer = CausalMask::new(16);
        for cache_len in [0usize, 2, 5] {
            let seq_q = 3;
            let seq_k = cache_len + seq_q;
            let mut buffered = Array4::<f32>::zeros((2, 2, seq_q, seq_k));
            let mut rolling = Array4::<f32>::zeros((2, 2, seq_q, seq_k));

            buffer.apply(&mut buffered, cache_len).unwrap();
            apply_causal_mask(&mut rolling, cache_len);

            assert_eq!(buffered, rolling, "cache_len={}", cache_len);
        }
    }

    #[test]
    fn test_causal_buffer_overflow_errors() {
        let buffer = CausalMask::new(4);
        let mut scores = Array4::<f32>::zeros((1, 1, 3, 5));
        assert!(buffer.apply(&mut scores, 2).is_err());
    }

    #[test]
    fn test_padding_mask_from_tokens() {
        let tokens = Array2::from_shape_vec((1, 5), vec![1u32, 2, 3, 0, 0]).unwrap();
        let mask = create_padding_mask_from_tokens(&tokens, 0);

        assert_eq!(mask[[0, 0]], 1.0);
        assert_eq!(mask[[0, 2]], 1.0);
        assert_eq!(mask[[0, 3]], 0.0);
        assert_eq!(mask[[0, 4]], 0.0);
    }
}
