//! Multi-head attention with KV caching support.
//!
//! A single scaled-dot-product routine serves every attention variant in the
//! workspace; callers pick the capability set (padding mask, causal mode,
//! query vs. key/value source) instead of duplicating the core math.

use anyhow::Result;
use ndarray::{s, Array2, Array3, ArrayView3, Axis};

use crate::activations::softmax_inplace;
use crate::linear_layer::LinearLayer;
use crate::utils::linear_algebra::matmul_4d;
use crate::utils::masks::{apply_causal_mask, apply_padding_mask, CausalMask};

/// How causal visibility is enforced for a given call.
pub enum CausalMode<'a> {
    /// Bidirectional attention (encoder self-attention, cross-attention).
    Off,
    /// Causal mask computed on the fly from the cache offset.
    Rolling { position_offset: usize },
    /// Causal mask sliced from a fixed lower-triangular buffer.
    Buffered {
        mask: &'a CausalMask,
        position_offset: usize,
    },
}

/// Scaled dot-product attention over `[batch, seq, hidden]` projections.
///
/// `q` has `num_heads * head_dim` features; `k`/`v` cover the full key/value
/// history (cache included). Returns the merged context
/// `[batch, q_len, num_heads * head_dim]`.
pub fn attend(
    q: &Array3<f32>,
    k: &Array3<f32>,
    v: &Array3<f32>,
    num_heads: usize,
    head_dim: usize,
    padding_mask: Option<&Array2<f32>>,
    causal: CausalMode<'_>,
) -> Result<Array3<f32>> {
    let batch_size = q.shape()[0];
    let q_len = q.shape()[1];
    let kv_len = k.shape()[1];

    assert_eq!(k.shape(), v.shape(), "K and V shapes must match");
    assert_eq!(
        q.shape()[0],
        k.shape()[0],
        "batch sizes of query and key/value must match"
    );

    // [batch, seq, hidden] -> [batch, heads, seq, head_dim]
    let q_heads = q
        .to_owned()
        .into_shape_with_order((batch_size, q_len, num_heads, head_dim))?
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .to_owned();
    let k_heads = k
        .to_owned()
        .into_shape_with_order((batch_size, kv_len, num_heads, head_dim))?
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .to_owned();
    let v_heads = v
        .to_owned()
        .into_shape_with_order((batch_size, kv_len, num_heads, head_dim))?
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .to_owned();

    let mut scores = matmul_4d(&q_heads, &k_heads);
    scores *= 1.0 / (head_dim as f32).sqrt();

    if let Some(mask) = padding_mask {
        scores = apply_padding_mask(scores, mask)?;
    }
    match causal {
        CausalMode::Off => {}
        CausalMode::Rolling { position_offset } => apply_causal_mask(&mut scores, position_offset),
        CausalMode::Buffered {
            mask,
            position_offset,
        } => mask.apply(&mut scores, position_offset)?,
    }

    softmax_inplace(&mut scores);
    let context = matmul_4d(&scores, &v_heads);

    // [batch, heads, q_len, head_dim] -> [batch, q_len, hidden]
    let merged = context
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .into_shape_with_order((batch_size, q_len, num_heads * head_dim))?
        .to_owned();

    Ok(merged)
}

/// Multi-head attention with learned Q/K/V/output projections.
#[derive(Debug)]
pub struct MultiHeadAttention {
    pub query: LinearLayer,
    pub key: LinearLayer,
    pub value: LinearLayer,
    pub output: LinearLayer,

    pub num_heads: usize,
    pub head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        query: LinearLayer,
        key: LinearLayer,
        value: LinearLayer,
        output: LinearLayer,
    ) -> Result<Self> {
        if hidden_size % num_heads != 0 {
            anyhow::bail!(crate::error::ConfigurationError::Invalid(format!(
                "hidden size {} is not a multiple of the number of attention heads {}",
                hidden_size, num_heads
            )));
        }
        Ok(Self {
            query,
            key,
            value,
            output,
            num_heads,
            head_dim: hidden_size / num_heads,
        })
    }

    /// Projects K and V from an arbitrary source (used to precompute
    /// cross-attention K/V from encoder states once per sequence).
    pub fn project_kv(&self, source: &Array3<f32>) -> (Array3<f32>, Array3<f32>) {
        (self.key.forward(source), self.value.forward(source))
    }

    /// Unified attention forward.
    ///
    /// * `key_value`: `Some` for cross-attention, `None` for self-attention.
    /// * `cached_kv`: previously projected K/V history to prepend.
    ///
    /// Returns `(output, new_k, new_v)`; the new projections cover only the
    /// current call and are what a cache should append.
    pub fn forward_with_cache(
        &self,
        query: &Array3<f32>,
        key_value: Option<&Array3<f32>>,
        attention_mask: Option<&Array2<f32>>,
        is_causal: bool,
        cached_kv: Option<(ArrayView3<f32>, ArrayView3<f32>)>,
    ) -> Result<(Array3<f32>, Array3<f32>, Array3<f32>)> {
        let kv_source = key_value.unwrap_or(query);

        let q_proj = self.query.forward(query);
        let new_k = self.key.forward(kv_source);
        let new_v = self.value.forward(kv_source);

        let cache_len = cached_kv.as_ref().map_or(0, |(k, _)| k.shape()[1]);

        let (full_k, full_v) = if let Some((cached_k, cached_v)) = cached_kv {
            let full_k = ndarray::concatenate![Axis(1), cached_k, new_k.view()]
                .as_standard_layout()
                .to_owned();
            let full_v = ndarray::concatenate![Axis(1), cached_v, new_v.view()]
                .as_standard_layout()
                .to_owned();
            (full_k, full_v)
        } else {
            (new_k.clone(), new_v.clone())
        };

        let causal = if is_causal {
            CausalMode::Rolling {
                position_offset: cache_len,
            }
        } else {
            CausalMode::Off
        };

        let context = attend(
            &q_proj,
            &full_k,
            &full_v,
            self.num_heads,
            self.head_dim,
            attention_mask,
            causal,
        )?;

        let output = self.output.forward(&context);
        Ok((output, new_k, new_v))
    }

    /// Cross-attention against K/V that were projected once up front.
    pub fn forward_precomputed(
        &self,
        query: &Array3<f32>,
        k: &Array3<f32>,
        v: &Array3<f32>,
        attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let q_proj = self.query.forward(query);
        let context = attend(
            &q_proj,
            k,
            v,
            self.num_heads,
            self.head_dim,
            attention_mask,
            CausalMode::Off,
        )?;
        Ok(self.output.forward(&context))
    }
}

/// Splits a fused QKV projection `[3 * hidden]` into its three parts along
/// the feature axis (GPT-2 checkpoint convention).
pub fn split_fused_qkv(
    fused: &Array3<f32>,
    hidden_size: usize,
) -> (Array3<f32>, Array3<f32>, Array3<f32>) {
    let q = fused.slice(s![.., .., 0..hidden_size]).to_owned();
    let k = fused
        .slice(s![.., .., hidden_size..2 * hidden_size])
        .to_owned();
    let v = fused
        .slice(s![.., .., 2 * hidden_size..3 * hidden_size])
        .to_owned();
    (q, k, v)
}
