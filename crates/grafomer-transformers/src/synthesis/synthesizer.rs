//! Learned synthesis of a student tensor from a teacher parameter group.

use anyhow::Result;
use ndarray::{Array1, Array2, Array3};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::activations::tanh_scalar;
use crate::error::ConfigurationError;
use crate::synthesis::selector::ParameterGroupSelector;
use crate::synthesis::teacher::TeacherContext;

fn xavier_mix(adjacent_layers: usize) -> Array1<f32> {
    // Fan-in 1 (one mixing row), fan-out = adjacent layer count.
    let bound = (6.0 / (1 + adjacent_layers) as f32).sqrt();
    Array1::random(adjacent_layers, Uniform::new(-bound, bound))
}

/// Synthesizes one student weight matrix of shape `(out, in)`.
///
/// The teacher group is captured at construction and never mutated; `mix`,
/// `scale` and `offset` are the learnable parameters, updated only by an
/// external optimizer between forward passes. The tanh keeps the mixed
/// teacher combination in (-1, 1); `scale`/`offset` are unconstrained, so
/// the synthesized values may exceed the teacher's magnitude range.
#[derive(Debug)]
pub struct WeightSynthesizer {
    role: String,
    group: Array3<f32>,
    mix: Array1<f32>,
    scale: Array2<f32>,
    offset: Array2<f32>,
}

impl WeightSynthesizer {
    pub fn new(
        context: &TeacherContext,
        role: &str,
        student_layer: usize,
        num_student_layers: usize,
        out_features: usize,
        in_features: usize,
    ) -> Result<Self> {
        let selector = ParameterGroupSelector::new(context);
        let group = selector.select_weights(role, student_layer, num_student_layers)?;

        let (adjacent, teacher_out, teacher_in) = group.dim();
        if (teacher_out, teacher_in) != (out_features, in_features) {
            return Err(ConfigurationError::ShapeMismatch {
                role: role.to_string(),
                expected: vec![out_features, in_features],
                actual: vec![teacher_out, teacher_in],
            }
            .into());
        }

        Ok(Self {
            role: role.to_string(),
            group,
            mix: xavier_mix(adjacent),
            scale: Array2::ones((out_features, in_features)),
            offset: Array2::zeros((out_features, in_features)),
        })
    }

    /// Produces the current weight value. Recomputed on every call so the
    /// result always reflects the current `mix`/`scale`/`offset`.
    pub fn synthesize(&self) -> Array2<f32> {
        let (_, out_features, in_features) = self.group.dim();
        let mut combined = Array2::<f32>::zeros((out_features, in_features));
        for (weight, layer) in self.mix.iter().zip(self.group.outer_iter()) {
            combined.scaled_add(*weight, &layer);
        }
        combined.mapv_inplace(tanh_scalar);
        combined * &self.scale + &self.offset
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn adjacent_layers(&self) -> usize {
        self.group.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.group.shape()[1]
    }

    pub fn in_features(&self) -> usize {
        self.group.shape()[2]
    }

    pub fn mix(&self) -> &Array1<f32> {
        &self.mix
    }

    // Learnable-parameter access for the optimizer.
    pub fn mix_mut(&mut self) -> &mut Array1<f32> {
        &mut self.mix
    }

    pub fn scale_mut(&mut self) -> &mut Array2<f32> {
        &mut self.scale
    }

    pub fn offset_mut(&mut self) -> &mut Array2<f32> {
        &mut self.offset
    }
}

/// Synthesizes one student bias vector of shape `(out,)`.
#[derive(Debug)]
pub struct BiasSynthesizer {
    role: String,
    group: Array2<f32>,
    mix: Array1<f32>,
    scale: Array1<f32>,
    offset: Array1<f32>,
}

impl BiasSynthesizer {
    pub fn new(
        context: &TeacherContext,
        role: &str,
        student_layer: usize,
        num_student_layers: usize,
        out_features: usize,
    ) -> Result<Self> {
        let selector = ParameterGroupSelector::new(context);
        let group = selector.select_biases(role, student_layer, num_student_layers)?;

        let (adjacent, teacher_out) = group.dim();
        if teacher_out != out_features {
            return Err(ConfigurationError::ShapeMismatch {
                role: role.to_string(),
                expected: vec![out_features],
                actual: vec![teacher_out],
            }
            .into());
        }

        Ok(Self {
            role: role.to_string(),
            group,
            mix: xavier_mix(adjacent),
            scale: Array1::ones(out_features),
            offset: Array1::zeros(out_features),
        })
    }

    pub fn synthesize(&self) -> Array1<f32> {
        let out_features = self.group.shape()[1];
        let mut combined = Array1::<f32>::zeros(out_features);
        for (weight, layer) in self.mix.iter().zip(self.group.outer_iter()) {
            combined.scaled_add(*weight, &layer);
        }
        combined.mapv_inplace(tanh_scalar);
        combined * &self.scale + &self.offset
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn adjacent_layers(&self) -> usize {
        self.group.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.group.shape()[1]
    }

    pub fn mix_mut(&mut self) -> &mut Array1<f32> {
        &mut self.mix
    }

    pub fn scale_mut(&mut self) -> &mut Array1<f32> {
        &mut self.scale
    }

    pub fn offset_mut(&mut self) -> &mut Array1<f32> {
        &mut self.offset
    }
}
