//! Core transformer components for grafted sequence-to-sequence models.
//!
//! This crate provides the architecture-agnostic building blocks (attention,
//! feed-forward, normalization, caching, weight loading) plus the
//! weight-synthesis pipeline that lets a student network derive its
//! parameters from a teacher's weight tensors at every forward pass.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod embeddings;
pub mod encoder;
pub mod encoder_decoder;
pub mod error;
pub mod feedforward;
pub mod linear_layer;
pub mod normalization;
pub mod synthesis;
pub mod utils;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    attention::MultiHeadAttention,
    cache::{Cache, CpuKVCache},
    embeddings::Embeddings,
    encoder::{EncoderLayer, EncoderOutput},
    encoder_decoder::CrossDecoderLayer,
    error::{ConfigurationError, InputContractError},
    feedforward::FeedForward,
    linear_layer::LinearLayer,
    normalization::LayerNorm,
    synthesis::{
        BiasSynthesizer, ParameterGroupSelector, SynthesizedLinear, TeacherContext,
        WeightSynthesizer,
    },
    weights::ModelWeights,
};

pub mod prelude {
    pub use crate::cache::{Cache, CpuKVCache};
    pub use crate::error::{ConfigurationError, InputContractError};
    pub use crate::synthesis::{SynthesizedLinear, TeacherContext};
    pub use crate::weights::ModelWeights;
}
