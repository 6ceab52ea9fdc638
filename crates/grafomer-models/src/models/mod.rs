//! Model traits and families.

use anyhow::Result;
use ndarray::{Array2, Array3};

use grafomer_transformers::cache::Cache;
use grafomer_transformers::error::InputContractError;

pub mod bert;
pub mod gpt2;
pub mod grafomer;
pub mod registry;
pub mod student;

#[cfg(test)]
pub(crate) mod test_fixtures;

/// A pretrained bidirectional encoder exposing its hidden states.
pub trait PretrainedEncoder: Send + Sync + std::fmt::Debug {
    fn forward(
        &self,
        input_ids: Option<&Array2<u32>>,
        inputs_embeds: Option<&Array3<f32>>,
        attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>>;

    fn hidden_size(&self) -> usize;
    fn max_positions(&self) -> usize;
}

/// A pretrained autoregressive decoder whose body and output head are
/// separately addressable, so a caller can modify the hidden state between
/// the two.
pub trait PretrainedDecoder: Send + Sync {
    /// Runs the decoder body only (no output head). The final hidden state
    /// has the decoder's native width.
    fn forward_body(
        &self,
        input_ids: Option<&Array2<u32>>,
        inputs_embeds: Option<&Array3<f32>>,
        attention_mask: Option<&Array2<f32>>,
        cache: Option<&mut dyn Cache>,
    ) -> Result<Array3<f32>>;

    /// Applies the decoder's original output head.
    fn project_to_logits(&self, hidden_states: &Array3<f32>) -> Result<Array3<f32>>;

    fn hidden_size(&self) -> usize;
    fn num_layers(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn max_positions(&self) -> usize;

    fn new_cache(&self, batch_size: usize, max_len: usize) -> Box<dyn Cache>;
}

/// Validates the token-ids / embedded-inputs contract shared by every
/// encoder and decoder forward, returning `(batch_size, seq_len)`.
pub(crate) fn resolve_input_shape(
    input_ids: Option<&Array2<u32>>,
    inputs_embeds: Option<&Array3<f32>>,
) -> Result<(usize, usize)> {
    let (batch_size, seq_len) = match (input_ids, inputs_embeds) {
        (Some(_), Some(_)) => return Err(InputContractError::AmbiguousInput.into()),
        (None, None) => return Err(InputContractError::MissingInput.into()),
        (Some(ids), None) => ids.dim(),
        (None, Some(embeds)) => (embeds.shape()[0], embeds.shape()[1]),
    };

    if batch_size == 0 {
        return Err(InputContractError::UndefinedBatchSize.into());
    }

    Ok((batch_size, seq_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    #[test]
    fn test_input_contract() {
        let ids = Array2::<u32>::zeros((2, 3));
        let embeds = Array3::<f32>::zeros((2, 3, 4));

        assert_eq!(resolve_input_shape(Some(&ids), None).unwrap(), (2, 3));
        assert_eq!(resolve_input_shape(None, Some(&embeds)).unwrap(), (2, 3));

        let err = resolve_input_shape(Some(&ids), Some(&embeds)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InputContractError>(),
            Some(InputContractError::AmbiguousInput)
        ));

        let err = resolve_input_shape(None, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InputContractError>(),
            Some(InputContractError::MissingInput)
        ));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let ids = Array2::<u32>::zeros((0, 3));
        let err = resolve_input_shape(Some(&ids), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InputContractError>(),
            Some(InputContractError::UndefinedBatchSize)
        ));
    }
}
