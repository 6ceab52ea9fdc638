//! Key-value caching for autoregressive decoding.

use std::any::Any;

use anyhow::Result;
use ndarray::{s, Array3, ArrayView3};
use rayon::prelude::*;

/// Runtime-polymorphic cache handle shared across model implementations.
pub trait Cache: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_box(&self) -> Box<dyn Cache>;

    fn set_seq_length(&mut self, len: usize);
    fn get_seq_length(&self) -> usize;
    fn clear(&mut self);
    fn increment_len(&mut self, new_tokens_len: usize);
}

/// Preallocated per-layer K/V storage on the CPU.
#[derive(Clone)]
pub struct CpuKVCache {
    layers: Vec<(Array3<f32>, Array3<f32>)>,
    current_len: usize,
}

impl CpuKVCache {
    pub fn new(num_layers: usize, batch_size: usize, max_len: usize, hidden_size: usize) -> Self {
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            let k_cache = Array3::zeros((batch_size, max_len, hidden_size));
            let v_cache = Array3::zeros((batch_size, max_len, hidden_size));
            layers.push((k_cache, v_cache));
        }

        Self {
            layers,
            current_len: 0,
        }
    }

    pub fn max_len(&self) -> usize {
        self.layers.first().map(|(k, _)| k.shape()[1]).unwrap_or(0)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn batch_size(&self) -> usize {
        self.layers.first().map(|(k, _)| k.shape()[0]).unwrap_or(0)
    }

    pub fn hidden_size(&self) -> usize {
        self.layers.first().map(|(k, _)| k.shape()[2]).unwrap_or(0)
    }

    /// Appends new K/V states for one layer at the current write position.
    /// The caller advances the shared position with [`Cache::increment_len`]
    /// after every layer has been updated.
    pub fn update(&mut self, layer_idx: usize, new_k: &Array3<f32>, new_v: &Array3<f32>) -> Result<()> {
        if layer_idx >= self.layers.len() {
            anyhow::bail!(
                "layer index {} out of bounds (num_layers={})",
                layer_idx,
                self.layers.len()
            );
        }

        let new_tokens_len = new_k.shape()[1];
        let end_pos = self.current_len + new_tokens_len;

        if end_pos > self.max_len() {
            anyhow::bail!(
                "cache overflow: current_len={}, new_tokens={}, max_len={}",
                self.current_len,
                new_tokens_len,
                self.max_len()
            );
        }

        let target_slice = s![.., self.current_len..end_pos, ..];

        let (cache_k, cache_v) = &mut self.layers[layer_idx];
        cache_k.slice_mut(target_slice).assign(new_k);
        cache_v.slice_mut(target_slice).assign(new_v);

        Ok(())
    }

    /// Returns the populated K/V views for one layer, or `None` if the layer
    /// index is out of range.
    pub fn get(&self, layer_idx: usize) -> Option<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
        if layer_idx >= self.layers.len() {
            return None;
        }

        let (cache_k, cache_v) = &self.layers[layer_idx];
        let active_slice = s![.., 0..self.current_len, ..];

        Some((cache_k.slice(active_slice), cache_v.slice(active_slice)))
    }

    /// Reorders the batch dimension, e.g. after a beam-search step.
    pub fn reorder(&mut self, indices: &[usize]) {
        let mut reordered_layers = self.layers.clone();

        self.layers
            .par_iter()
            .zip(reordered_layers.par_iter_mut())
            .for_each(|((k_cache, v_cache), (k_reordered, v_reordered))| {
                for (dest_idx, &source_idx) in indices.iter().enumerate() {
                    k_reordered
                        .slice_mut(s![dest_idx, .., ..])
                        .assign(&k_cache.slice(s![source_idx, .., ..]));
                    v_reordered
                        .slice_mut(s![dest_idx, .., ..])
                        .assign(&v_cache.slice(s![source_idx, .., ..]));
                }
            });

        self.layers = reordered_layers;
    }
}

impl Cache for CpuKVCache {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn Cache> {
        Box::new(self.clone())
    }

    fn set_seq_length(&mut self, len: usize) {
        self.current_len = len;
    }

    fn get_seq_length(&self) -> usize {
        self.current_len
    }

    fn clear(&mut self) {
        self.current_len = 0;
    }

    fn increment_len(&mut self, new_tokens_len: usize) {
        self.current_len += new_tokens_len;
    }
}
