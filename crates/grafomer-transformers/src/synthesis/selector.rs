//! Extraction and partitioning of teacher parameter groups.

use anyhow::Result;
use ndarray::{s, Array2, Array3, Axis};

use crate::error::ConfigurationError;
use crate::synthesis::teacher::{ParameterRole, TeacherContext};

/// The contiguous teacher-layer window assigned to one student layer.
///
/// `chunk = teacher_layers / num_student_layers` (integer division); student
/// layer `i` owns teacher layers `[i * chunk, (i + 1) * chunk)`. When the
/// teacher-layer count is not divisible, the trailing remainder layers are
/// deliberately excluded so every student layer mixes an equal-sized,
/// contiguous slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerAssignment {
    pub start: usize,
    pub end: usize,
}

impl LayerAssignment {
    pub fn compute(
        teacher_layers: usize,
        student_layer: usize,
        num_student_layers: usize,
        role: &str,
    ) -> Result<Self> {
        if num_student_layers == 0 {
            return Err(ConfigurationError::ZeroStudentLayers.into());
        }
        if student_layer >= num_student_layers {
            return Err(ConfigurationError::LayerIndexOutOfRange {
                index: student_layer,
                num_layers: num_student_layers,
            }
            .into());
        }

        let chunk = teacher_layers / num_student_layers;
        if chunk == 0 {
            return Err(ConfigurationError::TooFewTeacherLayers {
                role: role.to_string(),
                teacher_layers,
                num_student_layers,
            }
            .into());
        }

        Ok(Self {
            start: student_layer * chunk,
            end: (student_layer + 1) * chunk,
        })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Extracts the ordered teacher tensors for a role and slices out the group
/// assigned to one student layer. Pure read of teacher state.
pub struct ParameterGroupSelector<'a> {
    context: &'a TeacherContext,
}

impl<'a> ParameterGroupSelector<'a> {
    pub fn new(context: &'a TeacherContext) -> Self {
        Self { context }
    }

    /// Weight variant: returns `[adjacent_layers, out, in]`.
    pub fn select_weights(
        &self,
        role: &str,
        student_layer: usize,
        num_student_layers: usize,
    ) -> Result<Array3<f32>> {
        // Validate the partition before touching any tensor.
        if num_student_layers == 0 {
            return Err(ConfigurationError::ZeroStudentLayers.into());
        }

        let parsed = ParameterRole::parse(role)?;
        if self.context.is_empty(parsed.scope) {
            return Err(ConfigurationError::EmptyScope(parsed.scope.as_str()).into());
        }

        let matrices = self.context.matrices_matching(parsed.scope, &parsed.path);
        if matrices.is_empty() {
            return Err(ConfigurationError::EmptyGroup(role.to_string()).into());
        }

        let first_shape = matrices[0].shape().to_vec();
        for m in &matrices {
            if m.shape() != first_shape.as_slice() {
                return Err(ConfigurationError::InconsistentGroup {
                    role: role.to_string(),
                    first: first_shape,
                    other: m.shape().to_vec(),
                }
                .into());
            }
        }

        let assignment =
            LayerAssignment::compute(matrices.len(), student_layer, num_student_layers, role)?;

        let views: Vec<_> = matrices.iter().map(|m| m.view()).collect();
        let stacked = ndarray::stack(Axis(0), &views)?;

        Ok(stacked
            .slice(s![assignment.start..assignment.end, .., ..])
            .to_owned())
    }

    /// Bias variant: returns `[adjacent_layers, out]`.
    pub fn select_biases(
        &self,
        role: &str,
        student_layer: usize,
        num_student_layers: usize,
    ) -> Result<Array2<f32>> {
        if num_student_layers == 0 {
            return Err(ConfigurationError::ZeroStudentLayers.into());
        }

        let parsed = ParameterRole::parse(role)?;
        if self.context.is_empty(parsed.scope) {
            return Err(ConfigurationError::EmptyScope(parsed.scope.as_str()).into());
        }

        let vectors = self.context.vectors_matching(parsed.scope, &parsed.path);
        if vectors.is_empty() {
            return Err(ConfigurationError::EmptyGroup(role.to_string()).into());
        }

        let first_len = vectors[0].len();
        for v in &vectors {
            if v.len() != first_len {
                return Err(ConfigurationError::InconsistentGroup {
                    role: role.to_string(),
                    first: vec![first_len],
                    other: vec![v.len()],
                }
                .into());
            }
        }

        let assignment =
            LayerAssignment::compute(vectors.len(), student_layer, num_student_layers, role)?;

        let views: Vec<_> = vectors.iter().map(|v| v.view()).collect();
        let stacked = ndarray::stack(Axis(0), &views)?;

        Ok(stacked
            .slice(s![assignment.start..assignment.end, ..])
            .to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::teacher::TeacherScope;
    use ndarray::{Array1, Array2};

    /// A teacher whose layer-l query weight is filled with the value l.
    fn teacher_with_layers(num_layers: usize) -> TeacherContext {
        let mut ctx = TeacherContext::new();
        for layer in 0..num_layers {
            ctx.register_matrix(
                TeacherScope::Encoder,
                format!("layer.{}.attention.self.query.weight", layer),
                Array2::from_elem((4, 4), layer as f32),
            );
            ctx.register_vector(
                TeacherScope::Encoder,
                format!("layer.{}.attention.self.query.bias", layer),
                Array1::from_elem(4, layer as f32),
            );
        }
        ctx
    }

    #[test]
    fn test_chunk_size_is_floor_of_ratio() {
        let ctx = teacher_with_layers(12);
        let selector = ParameterGroupSelector::new(&ctx);

        let group = selector
            .select_weights("encoder.attention.self.query", 0, 4)
            .unwrap();
        assert_eq!(group.dim(), (3, 4, 4));

        // 12 teacher layers over 5 student layers: chunk = 2, remainder dropped
        let group = selector
            .select_weights("encoder.attention.self.query", 0, 5)
            .unwrap();
        assert_eq!(group.shape()[0], 2);
    }

    #[test]
    fn test_last_student_layer_gets_final_chunk() {
        let ctx = teacher_with_layers(12);
        let selector = ParameterGroupSelector::new(&ctx);

        let group = selector
            .select_weights("encoder.attention.self.query", 3, 4)
            .unwrap();

        // Teacher layers 9, 10, 11
        assert_eq!(group[[0, 0, 0]], 9.0);
        assert_eq!(group[[1, 0, 0]], 10.0);
        assert_eq!(group[[2, 0, 0]], 11.0);
    }

    #[test]
    fn test_selections_are_contiguous_and_disjoint() {
        let ctx = teacher_with_layers(12);
        let selector = ParameterGroupSelector::new(&ctx);

        let mut seen = Vec::new();
        for student_layer in 0..4 {
            let group = selector
                .select_weights("encoder.attention.self.query", student_layer, 4)
                .unwrap();
            for l in 0..group.shape()[0] {
                seen.push(group[[l, 0, 0]] as usize);
            }
        }

        // Concatenating the per-layer selections reproduces a prefix of the
        // teacher-layer sequence.
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_trailing_remainder_layers_are_excluded() {
        let ctx = teacher_with_layers(12);
        let selector = ParameterGroupSelector::new(&ctx);

        let mut seen = Vec::new();
        for student_layer in 0..5 {
            let group = selector
                .select_weights("encoder.attention.self.query", student_layer, 5)
                .unwrap();
            for l in 0..group.shape()[0] {
                seen.push(group[[l, 0, 0]] as usize);
            }
        }

        // chunk = 12 / 5 = 2; teacher layers 10 and 11 are never assigned.
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_bias_selection() {
        let ctx = teacher_with_layers(6);
        let selector = ParameterGroupSelector::new(&ctx);

        let group = selector
            .select_biases("encoder.attention.self.query", 1, 3)
            .unwrap();

        assert_eq!(group.dim(), (2, 4));
        assert_eq!(group[[0, 0]], 2.0);
        assert_eq!(group[[1, 0]], 3.0);
    }

    #[test]
    fn test_zero_student_layers_errors() {
        let ctx = teacher_with_layers(4);
        let selector = ParameterGroupSelector::new(&ctx);

        let err = selector
            .select_weights("encoder.attention.self.query", 0, 0)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::ZeroStudentLayers)
        ));
    }

    #[test]
    fn test_unmatched_role_errors() {
        let ctx = teacher_with_layers(4);
        let selector = ParameterGroupSelector::new(&ctx);

        let err = selector
            .select_weights("encoder.mlp.c_fc", 0, 2)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::EmptyGroup(_))
        ));
    }

    #[test]
    fn test_unregistered_scope_errors() {
        let ctx = teacher_with_layers(4);
        let selector = ParameterGroupSelector::new(&ctx);

        let err = selector
            .select_weights("decoder.attn.c_attn", 0, 2)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::EmptyScope("decoder"))
        ));
    }

    #[test]
    fn test_more_students_than_teachers_errors() {
        let ctx = teacher_with_layers(2);
        let selector = ParameterGroupSelector::new(&ctx);

        let err = selector
            .select_weights("encoder.attention.self.query", 0, 4)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::TooFewTeacherLayers { .. })
        ));
    }

    #[test]
    fn test_inconsistent_group_shapes_error() {
        let mut ctx = TeacherContext::new();
        ctx.register_matrix(
            TeacherScope::Encoder,
            "layer.0.dense.weight",
            Array2::zeros((4, 4)),
        );
        ctx.register_matrix(
            TeacherScope::Encoder,
            "layer.1.dense.weight",
            Array2::zeros((4, 8)),
        );

        let selector = ParameterGroupSelector::new(&ctx);
        let err = selector.select_weights("encoder.dense", 0, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::InconsistentGroup { .. })
        ));
    }
}
