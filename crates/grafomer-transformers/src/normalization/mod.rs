//! Layer normalization.

use anyhow::Result;
use ndarray::{Array1, Array3, ArrayView3, Axis};

use crate::weights::ModelWeights;

#[derive(Debug)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// A freshly initialized norm: unit weight, zero bias.
    pub fn identity(hidden_size: usize, eps: f32) -> Self {
        Self {
            weight: Array1::ones(hidden_size),
            bias: Array1::zeros(hidden_size),
            eps,
        }
    }

    pub fn from_weights(
        weights: &ModelWeights,
        weight_name: &str,
        bias_name: &str,
        eps: f32,
    ) -> Result<Self> {
        Ok(Self {
            weight: weights.get_array1(weight_name)?,
            bias: weights.get_array1(bias_name)?,
            eps,
        })
    }

    /// Normalize over the last axis of a `[batch, seq, hidden]` tensor.
    #[inline]
    pub fn forward(&self, hidden_states: &ArrayView3<f32>) -> Array3<f32> {
        let mean = hidden_states.mean_axis(Axis(2)).unwrap();
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let var_expanded = variance.insert_axis(Axis(2));

        let inv_std = (&var_expanded + self.eps).mapv(|x| 1.0 / x.sqrt());
        let normalized = (hidden_states.to_owned() - &mean_expanded) * &inv_std;

        normalized * &self.weight + &self.bias
    }

    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        self.forward(&hidden.view())
    }
}
