//! Token, position and token-type embedding lookup.

use ndarray::{s, Array2, Array3, Axis};
use rayon::prelude::*;

/// A CPU embedding layer handling word, position and token-type tables.
#[derive(Debug)]
pub struct Embeddings {
    pub word_embeddings: Array2<f32>,
    pub position_embeddings: Option<Array2<f32>>,
    pub token_type_embeddings: Option<Array2<f32>>,
}

impl Embeddings {
    pub fn new(
        word_embeddings: Array2<f32>,
        position_embeddings: Option<Array2<f32>>,
        token_type_embeddings: Option<Array2<f32>>,
    ) -> Self {
        Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.word_embeddings.shape()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.word_embeddings.shape()[1]
    }

    /// Full embedding forward pass.
    ///
    /// `position_offset` shifts the position-embedding window, which matters
    /// for incremental decoding with absolute positions.
    pub fn forward(
        &self,
        input_ids: &Array2<u32>,
        token_type_ids: Option<&Array2<u32>>,
        position_offset: usize,
    ) -> Array3<f32> {
        let (batch_size, seq_len) = input_ids.dim();
        let hidden_size = self.hidden_size();

        let mut hidden = Array3::<f32>::zeros((batch_size, seq_len, hidden_size));
        self.perform_word_lookup(&mut hidden, input_ids);

        if let Some(ref pos_emb) = self.position_embeddings {
            let max_position = pos_emb.shape()[0];
            let end = (position_offset + seq_len).min(max_position);
            let len = end.saturating_sub(position_offset);
            if len > 0 {
                let pos_slice = pos_emb.slice(s![position_offset..position_offset + len, ..]);
                let pos_broadcast = pos_slice.insert_axis(Axis(0));
                let mut target = hidden.slice_mut(s![.., 0..len, ..]);
                target += &pos_broadcast;
            }
        }

        if let Some(ref type_emb) = self.token_type_embeddings {
            match token_type_ids {
                Some(type_ids) => {
                    for b in 0..batch_size {
                        for j in 0..seq_len {
                            let type_id = type_ids[[b, j]] as usize;
                            let mut slice = hidden.slice_mut(s![b, j, ..]);
                            slice += &type_emb.row(type_id);
                        }
                    }
                }
                None => {
                    // Default segment 0 for every token
                    hidden += &type_emb.row(0);
                }
            }
        }

        hidden
    }

    fn perform_word_lookup(&self, hidden: &mut Array3<f32>, input_ids: &Array2<u32>) {
        let vocab_size = self.vocab_size();

        hidden
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(input_ids.axis_iter(Axis(0)))
            .for_each(|(mut hidden_slice, ids)| {
                for (j, &token_id) in ids.iter().enumerate() {
                    let token_id = token_id as usize;
                    if token_id < vocab_size {
                        hidden_slice
                            .slice_mut(s![j, ..])
                            .assign(&self.word_embeddings.row(token_id));
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_embeddings() -> Embeddings {
        // vocab 4, hidden 2; row i = [i, 10 + i]
        let word = Array2::from_shape_fn((4, 2), |(i, j)| {
            if j == 0 {
                i as f32
            } else {
                10.0 + i as f32
            }
        });
        let pos = Array2::from_shape_fn((8, 2), |(i, _)| i as f32 * 100.0);
        Embeddings::new(word, Some(pos), None)
    }

    #[test]
    fn test_word_lookup() {
        let emb = Embeddings::new(toy_embeddings().word_embeddings, None, None);
        let ids = Array2::from_shape_vec((1, 3), vec![0u32, 2, 3]).unwrap();
        let out = emb.forward(&ids, None, 0);

        assert_eq!(out.dim(), (1, 3, 2));
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[0, 1, 0]], 2.0);
        assert_eq!(out[[0, 2, 1]], 13.0);
    }

    #[test]
    fn test_position_offset_shifts_window() {
        let emb = toy_embeddings();
        let ids = Array2::from_shape_vec((1, 1), vec![1u32]).unwrap();

        let step0 = emb.forward(&ids, None, 0);
        let step3 = emb.forward(&ids, None, 3);

        assert_eq!(step0[[0, 0, 0]], 1.0);
        assert_eq!(step3[[0, 0, 0]], 1.0 + 300.0);
    }

    #[test]
    fn test_token_type_defaults_to_segment_zero() {
        let word = Array2::<f32>::zeros((4, 2));
        let types = Array2::from_shape_fn((2, 2), |(i, _)| (i + 1) as f32);
        let emb = Embeddings::new(word, None, Some(types));

        let ids = Array2::from_shape_vec((1, 2), vec![0u32, 1]).unwrap();
        let out = emb.forward(&ids, None, 0);

        assert!(out.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_explicit_token_types() {
        let word = Array2::<f32>::zeros((4, 2));
        let types = Array2::from_shape_fn((2, 2), |(i, _)| (i + 1) as f32);
        let emb = Embeddings::new(word, None, Some(types));

        let ids = Array2::from_shape_vec((1, 2), vec![0u32, 1]).unwrap();
        let type_ids = Array2::from_shape_vec((1, 2), vec![0u32, 1]).unwrap();
        let out = emb.forward(&ids, Some(&type_ids), 0);

        assert_eq!(out[[0, 0, 0]], 1.0);
        assert_eq!(out[[0, 1, 0]], 2.0);
    }
}
