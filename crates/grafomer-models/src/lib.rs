//! Concrete model families for grafted sequence-to-sequence modeling.
//!
//! Pretrained halves (a BERT-style encoder, a GPT-2-style decoder) are
//! loaded from safetensors checkpoints and composed by [`GrafomerModel`]
//! with a freshly trained [`GraftBridge`] between them. The student side
//! mirrors both architectures but synthesizes every dense projection from a
//! teacher's parameters.

pub mod models;

pub use crate::models::{
    bert::{BertConfig, BertEncoderModel},
    gpt2::{Gpt2Config, Gpt2DecoderModel},
    grafomer::{GraftBridge, GraftConfig, GrafomerConfig, GrafomerModel, GrafomerOutput},
    registry::ModelRegistry,
    student::{StudentDecoder, StudentDecoderConfig, StudentEncoder, StudentEncoderConfig, StudentLmModel},
    PretrainedDecoder, PretrainedEncoder,
};
