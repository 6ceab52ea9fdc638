//! SafeTensors-backed weight loading.
//!
//! [`ModelWeights`] maps tensor names to f32 `ndarray` views over an mmap'd
//! `model.safetensors` file, alongside the model's `config.json` text.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use memmap2::Mmap;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;

struct ModelWeightsInner {
    // Held so the transmuted SafeTensors borrow below stays valid.
    #[allow(dead_code)]
    mmap: Mmap,
    tensors: SafeTensors<'static>,
    config_json: String,
}

/// Read-only access to a model checkpoint.
///
/// Clones share the same underlying mmap through `Arc`.
pub struct ModelWeights {
    inner: Arc<ModelWeightsInner>,
}

impl Clone for ModelWeights {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ModelWeights {
    /// Loads `model.safetensors` and `config.json` from a model directory,
    /// or a `.safetensors` file directly (config defaults to `{}`).
    pub fn new(path: &Path) -> Result<Self> {
        let (weights_path, config_json) = if path.is_dir() {
            let config_path = path.join("config.json");
            let config_json = if config_path.exists() {
                fs::read_to_string(&config_path)
                    .with_context(|| format!("failed to read {:?}", config_path))?
            } else {
                "{}".to_string()
            };
            (path.join("model.safetensors"), config_json)
        } else {
            (path.to_path_buf(), "{}".to_string())
        };

        let file = fs::File::open(&weights_path)
            .with_context(|| format!("failed to open {:?}", weights_path))?;
        let mmap = unsafe { Mmap::map(&file)? };

        // The mmap lives in the same Arc as the parsed view, so the borrow
        // cannot outlive the backing bytes.
        let static_slice: &'static [u8] =
            unsafe { std::mem::transmute::<&[u8], &'static [u8]>(&mmap[..]) };
        let tensors = SafeTensors::deserialize(static_slice)
            .with_context(|| format!("failed to parse safetensors: {:?}", weights_path))?;

        log::info!(
            "loaded {} tensors from {:?}",
            tensors.names().len(),
            weights_path.file_name().unwrap_or_default()
        );

        Ok(Self {
            inner: Arc::new(ModelWeightsInner {
                mmap,
                tensors,
                config_json,
            }),
        })
    }

    pub fn config_json(&self) -> &str {
        &self.inner.config_json
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.tensors.names().iter().any(|n| *n == name)
    }

    pub fn tensor_names(&self) -> Vec<&str> {
        self.inner.tensors.names().iter().map(|n| n.as_str()).collect()
    }

    fn get_f32_data(&self, name: &str) -> Result<(Vec<usize>, Vec<f32>)> {
        let view = self
            .inner
            .tensors
            .tensor(name)
            .map_err(|_| anyhow!("tensor '{}' not found in model", name))?;

        if view.dtype() != Dtype::F32 {
            return Err(anyhow!(
                "tensor '{}' has dtype {:?}; only F32 checkpoints are supported",
                name,
                view.dtype()
            ));
        }

        let data = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok((view.shape().to_vec(), data))
    }

    pub fn get_array(&self, name: &str) -> Result<ArrayD<f32>> {
        let (shape, data) = self.get_f32_data(name)?;
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
    }

    pub fn get_array1(&self, name: &str) -> Result<Array1<f32>> {
        let (shape, data) = self.get_f32_data(name)?;
        if shape.len() != 1 {
            return Err(anyhow!(
                "tensor '{}' has rank {}, expected a vector",
                name,
                shape.len()
            ));
        }
        Ok(Array1::from_vec(data))
    }

    pub fn get_array2(&self, name: &str) -> Result<Array2<f32>> {
        let (shape, data) = self.get_f32_data(name)?;
        if shape.len() != 2 {
            return Err(anyhow!(
                "tensor '{}' has rank {}, expected a matrix",
                name,
                shape.len()
            ));
        }
        Ok(Array2::from_shape_vec((shape[0], shape[1]), data)?)
    }
}
