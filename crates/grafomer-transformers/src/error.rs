//! Typed errors for construction-time and forward-call contract violations.
//!
//! Fallible paths throughout the workspace return `anyhow::Result`; these
//! enums are the typed payloads, so callers that care can downcast while
//! everything else just propagates with `?`.

use thiserror::Error;

/// A deterministic configuration defect, caught at construction time and
/// never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid parameter role '{0}': expected '<scope>.<path>'")]
    InvalidRole(String),

    #[error("unknown teacher scope '{0}' (expected 'encoder' or 'decoder')")]
    UnknownScope(String),

    #[error("no teacher parameters registered for scope '{0}'")]
    EmptyScope(&'static str),

    #[error("parameter role '{0}' matched no teacher tensors")]
    EmptyGroup(String),

    #[error("number of student layers must be greater than zero")]
    ZeroStudentLayers,

    #[error("student layer index {index} out of range for {num_layers} student layers")]
    LayerIndexOutOfRange { index: usize, num_layers: usize },

    #[error(
        "{num_student_layers} student layers cannot be assigned from {teacher_layers} \
         teacher layers for role '{role}'"
    )]
    TooFewTeacherLayers {
        role: String,
        teacher_layers: usize,
        num_student_layers: usize,
    },

    #[error(
        "shape mismatch for role '{role}': teacher group has per-layer shape {actual:?}, \
         student expects {expected:?}"
    )]
    ShapeMismatch {
        role: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensors matched by role '{role}' have inconsistent shapes: {first:?} vs {other:?}")]
    InconsistentGroup {
        role: String,
        first: Vec<usize>,
        other: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A violation of the forward-call input contract.
#[derive(Debug, Error)]
pub enum InputContractError {
    #[error("cannot specify both token ids and embedded inputs")]
    AmbiguousInput,

    #[error("either token ids or embedded inputs must be specified")]
    MissingInput,

    #[error("batch size could not be determined from the provided inputs")]
    UndefinedBatchSize,
}
