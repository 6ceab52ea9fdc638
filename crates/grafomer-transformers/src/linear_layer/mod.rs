//! A CPU linear layer (`y = x W^T + b`).
//!
//! Weight tensors are stored in `[OutFeatures, InFeatures]` layout, matching
//! the standard layout in safetensors checkpoints; the matmul performs the
//! transposed multiplication.

use anyhow::Result;
use ndarray::{Array1, Array2, Array3, ArrayView2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::utils::linear_algebra::{matmul_2d_transposed, matmul_3d_2d_transposed};
use crate::weights::ModelWeights;

#[derive(Debug)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearLayer {
    /// Assumes `weight` is in `[OutFeatures, InFeatures]` layout.
    pub fn new(weight: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self {
            weight,
            bias: bias.into(),
        }
    }

    /// Loads a weight (and optionally a bias) tensor by name.
    pub fn from_weights(
        weights: &ModelWeights,
        weight_name: &str,
        bias_name: Option<&str>,
    ) -> Result<Self> {
        let weight = weights.get_array2(weight_name)?;
        let bias = bias_name.map(|n| weights.get_array1(n)).transpose()?;
        Ok(Self { weight, bias })
    }

    /// A freshly initialized layer: Xavier-uniform weight, zero bias.
    pub fn xavier(out_features: usize, in_features: usize) -> Self {
        let bound = (6.0 / (in_features + out_features) as f32).sqrt();
        let weight = Array2::random((out_features, in_features), Uniform::new(-bound, bound));
        Self {
            weight,
            bias: Some(Array1::zeros(out_features)),
        }
    }

    /// Computes `y = x @ W^T + b` for a 2D input `[rows, in]`.
    #[inline]
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut result = matmul_2d_transposed(input, &self.weight.view());
        if let Some(b) = &self.bias {
            result.outer_iter_mut().for_each(|mut row| row += b);
        }
        result
    }

    /// Computes `y = x @ W^T + b` for a 3D input `[batch, seq, in]`.
    #[inline]
    pub fn forward(&self, input: &Array3<f32>) -> Array3<f32> {
        let mut result = matmul_3d_2d_transposed(input, &self.weight);
        if let Some(b) = &self.bias {
            result += b;
        }
        result
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.out_features(), self.in_features()]
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }
}

impl From<Array2<f32>> for LinearLayer {
    fn from(weight: Array2<f32>) -> Self {
        LinearLayer::new(weight, None)
    }
}

impl From<(Array2<f32>, Array1<f32>)> for LinearLayer {
    fn from((weight, bias): (Array2<f32>, Array1<f32>)) -> Self {
        LinearLayer::new(weight, Some(bias))
    }
}
