//! A linear layer whose parameters are synthesized on demand.

use anyhow::Result;
use ndarray::Array3;

use crate::synthesis::synthesizer::{BiasSynthesizer, WeightSynthesizer};
use crate::synthesis::teacher::TeacherContext;
use crate::utils::linear_algebra::matmul_3d_2d_transposed;

/// An affine transform `y = x W^T + b` where `W` and `b` are produced by
/// paired synthesizers on every call instead of being stored. This is the
/// sole mechanism by which student blocks obtain dense-projection
/// parameters; each instance is keyed by the parameter role naming its
/// structural position in the teacher.
#[derive(Debug)]
pub struct SynthesizedLinear {
    weight: WeightSynthesizer,
    bias: BiasSynthesizer,
}

impl SynthesizedLinear {
    pub fn new(
        context: &TeacherContext,
        role: &str,
        student_layer: usize,
        num_student_layers: usize,
        in_features: usize,
        out_features: usize,
    ) -> Result<Self> {
        let weight = WeightSynthesizer::new(
            context,
            role,
            student_layer,
            num_student_layers,
            out_features,
            in_features,
        )?;
        let bias = BiasSynthesizer::new(
            context,
            role,
            student_layer,
            num_student_layers,
            out_features,
        )?;

        Ok(Self { weight, bias })
    }

    /// `[batch, seq, in] -> [batch, seq, out]`, with the weight and bias
    /// rebuilt from the synthesizers so parameter drift during training is
    /// always reflected.
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let weight = self.weight.synthesize();
        let bias = self.bias.synthesize();

        let mut output = matmul_3d_2d_transposed(input, &weight);
        output += &bias;
        Ok(output)
    }

    pub fn in_features(&self) -> usize {
        self.weight.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.weight.out_features()
    }

    pub fn weight_synthesizer_mut(&mut self) -> &mut WeightSynthesizer {
        &mut self.weight
    }

    pub fn bias_synthesizer_mut(&mut self) -> &mut BiasSynthesizer {
        &mut self.bias
    }
}
