//! Activation functions and softmax operations.

use std::str::FromStr;

use libm::{erff, expf, tanhf};
use ndarray::{Array3, Array4, ArrayViewMut1, Axis};
use serde::{Deserialize, Serialize};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;
const SQRT_2_OVER_PI: f32 = 0.7978845608;
const GELU_COEFF: f32 = 0.044715;

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[serde(alias = "gelu")]
    Gelu,
    #[serde(alias = "gelu_new")]
    GeluNew,
    #[serde(alias = "relu")]
    Relu,
    #[serde(alias = "tanh")]
    Tanh,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" => Ok(Activation::GeluNew),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(format!("unknown activation function: {}", s)),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::GeluNew
    }
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn gelu_new_scalar(x: f32) -> f32 {
    let x_cubed = x * x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_cubed);
    0.5 * x * (1.0 + tanhf(inner))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn tanh_scalar(x: f32) -> f32 {
    tanhf(x)
}

fn scalar_fn(activation: Activation) -> fn(f32) -> f32 {
    match activation {
        Activation::Gelu => gelu_scalar,
        Activation::GeluNew => gelu_new_scalar,
        Activation::Relu => relu_scalar,
        Activation::Tanh => tanh_scalar,
    }
}

/// Applies an activation in-place to a 3D tensor.
pub fn apply_activation(arr: &mut Array3<f32>, activation: Activation) {
    let f = scalar_fn(activation);
    if arr.len() >= PARALLEL_THRESHOLD {
        arr.par_mapv_inplace(f);
    } else {
        arr.mapv_inplace(f);
    }
}

/// Applies an activation in-place to a 2D tensor.
pub fn apply_activation_2d(arr: &mut ndarray::Array2<f32>, activation: Activation) {
    let f = scalar_fn(activation);
    if arr.len() >= PARALLEL_THRESHOLD {
        arr.par_mapv_inplace(f);
    } else {
        arr.mapv_inplace(f);
    }
}

fn softmax_row(mut row: ArrayViewMut1<f32>) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = expf(*v - max);
        sum += *v;
    }
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for v in row.iter_mut() {
            *v *= inv;
        }
    }
}

/// Numerically stable softmax over the last axis of a 4D score tensor
/// `[batch, heads, queries, keys]`.
pub fn softmax(scores: &Array4<f32>) -> Array4<f32> {
    let mut out = scores.clone();
    softmax_inplace(&mut out);
    out
}

/// In-place variant of [`softmax`].
pub fn softmax_inplace(scores: &mut Array4<f32>) {
    for mut batch in scores.axis_iter_mut(Axis(0)) {
        for mut head in batch.axis_iter_mut(Axis(0)) {
            for row in head.axis_iter_mut(Axis(0)) {
                softmax_row(row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};

    #[test]
    fn test_activation_from_str() {
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!(
            "gelu_new".parse::<Activation>().unwrap(),
            Activation::GeluNew
        );
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert!("mish".parse::<Activation>().is_err());
    }

    #[test]
    fn test_gelu_known_values() {
        // torch.nn.functional.gelu reference values
        assert!((gelu_scalar(0.0) - 0.0).abs() < 1e-6);
        assert!((gelu_scalar(1.0) - 0.8413447).abs() < 1e-4);
        assert!((gelu_scalar(-1.0) - (-0.15865526)).abs() < 1e-4);
    }

    #[test]
    fn test_gelu_new_close_to_gelu() {
        for x in [-3.0f32, -1.0, -0.1, 0.0, 0.5, 2.0] {
            assert!(
                (gelu_scalar(x) - gelu_new_scalar(x)).abs() < 1e-2,
                "tanh approximation diverges at {}",
                x
            );
        }
    }

    #[test]
    fn test_apply_activation_relu() {
        let mut arr = Array2::from_shape_vec((1, 4), vec![-1.0, 0.0, 0.5, 2.0]).unwrap();
        apply_activation_2d(&mut arr, Activation::Relu);
        assert_eq!(arr.as_slice().unwrap(), &[0.0, 0.0, 0.5, 2.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let scores = Array4::from_shape_fn((2, 3, 4, 5), |(b, h, q, k)| {
            (b + h + q) as f32 * 0.3 - k as f32 * 0.1
        });
        let probs = softmax(&scores);

        for b in 0..2 {
            for h in 0..3 {
                for q in 0..4 {
                    let sum: f32 = (0..5).map(|k| probs[[b, h, q, k]]).sum();
                    assert!((sum - 1.0).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_softmax_handles_large_magnitudes() {
        let scores =
            Array4::from_shape_vec((1, 1, 1, 3), vec![1000.0, 1000.0, -1e9]).unwrap();
        let probs = softmax(&scores);
        assert!((probs[[0, 0, 0, 0]] - 0.5).abs() < 1e-5);
        assert!((probs[[0, 0, 0, 1]] - 0.5).abs() < 1e-5);
        assert!(probs[[0, 0, 0, 2]] < 1e-6);
    }
}
