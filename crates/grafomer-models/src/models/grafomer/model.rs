//! Top-level grafted encoder-decoder composition.

use std::path::Path;

use anyhow::Result;
use ndarray::{s, Array2, Array3, Axis};

use grafomer_transformers::cache::Cache;
use grafomer_transformers::error::InputContractError;
use grafomer_transformers::utils::masks::create_full_attention_mask;

use crate::models::grafomer::bridge::GraftBridge;
use crate::models::grafomer::config::{GraftConfig, GrafomerConfig};
use crate::models::registry::ModelRegistry;
use crate::models::{PretrainedDecoder, PretrainedEncoder};

pub struct GrafomerOutput {
    pub logits: Array3<f32>,
    /// Returned so generation loops can encode once and reuse.
    pub encoder_hidden_state: Array3<f32>,
}

/// A pretrained encoder and a pretrained decoder joined by a trainable
/// graft bridge. The bridge's correction is added to the decoder's own
/// hidden state before the decoder's original LM head.
pub struct GrafomerModel {
    encoder: Box<dyn PretrainedEncoder>,
    decoder: Box<dyn PretrainedDecoder>,
    bridge: GraftBridge,
    decoder_start_token_id: u32,
}

impl GrafomerModel {
    pub fn new(
        encoder: Box<dyn PretrainedEncoder>,
        decoder: Box<dyn PretrainedDecoder>,
        graft_config: &GraftConfig,
        decoder_start_token_id: u32,
    ) -> Result<Self> {
        let bridge = GraftBridge::new(
            graft_config,
            encoder.hidden_size(),
            decoder.hidden_size(),
        )?;

        Ok(Self {
            encoder,
            decoder,
            bridge,
            decoder_start_token_id,
        })
    }

    /// Resolves both pretrained halves through the registry and assembles
    /// the grafted model.
    pub fn from_config(registry: &ModelRegistry, config: &GrafomerConfig) -> Result<Self> {
        let encoder = registry.load_encoder(&config.encoder.family, Path::new(&config.encoder.path))?;
        let decoder = registry.load_decoder(&config.decoder.family, Path::new(&config.decoder.path))?;
        Self::new(encoder, decoder, &config.graft, config.decoder_start_token_id)
    }

    pub fn encoder(&self) -> &dyn PretrainedEncoder {
        self.encoder.as_ref()
    }

    pub fn decoder(&self) -> &dyn PretrainedDecoder {
        self.decoder.as_ref()
    }

    pub fn decoder_start_token_id(&self) -> u32 {
        self.decoder_start_token_id
    }

    /// Full seq2seq forward.
    ///
    /// With `decoder_input_ids` present this is the teacher-forced training
    /// path; without them the decoder consumes `input_ids` itself
    /// (self-feeding evaluation). A previously computed encoder state can be
    /// passed to skip re-encoding; a cache enables incremental decoding.
    pub fn forward(
        &self,
        input_ids: Option<&Array2<u32>>,
        attention_mask: Option<&Array2<f32>>,
        decoder_input_ids: Option<&Array2<u32>>,
        decoder_attention_mask: Option<&Array2<f32>>,
        encoder_hidden_state: Option<&Array3<f32>>,
        cache: Option<&mut dyn Cache>,
    ) -> Result<GrafomerOutput> {
        // 1. Encode (or reuse)
        let encoder_hidden = match encoder_hidden_state {
            Some(state) => state.clone(),
            None => self.encoder.forward(input_ids, None, attention_mask)?,
        };
        let (enc_batch, src_len, _) = encoder_hidden.dim();

        let owned_encoder_mask;
        let encoder_mask = match attention_mask {
            Some(m) => m,
            None => {
                owned_encoder_mask = create_full_attention_mask(enc_batch, src_len);
                &owned_encoder_mask
            }
        };

        // 2. Decode with the body only
        let dec_ids = decoder_input_ids
            .or(input_ids)
            .ok_or(InputContractError::MissingInput)?;
        let (batch_size, dec_len) = dec_ids.dim();

        let cache_len = cache.as_ref().map_or(0, |c| c.get_seq_length());
        let body_mask = match (decoder_attention_mask, cache_len) {
            (Some(m), 0) => m.clone(),
            // With a running cache the mask must cover the whole history.
            _ => create_full_attention_mask(batch_size, cache_len + dec_len),
        };

        let decoder_hidden =
            self.decoder
                .forward_body(Some(dec_ids), None, Some(&body_mask), cache)?;

        // 3. Bridge correction over the current decoder window
        let bridge_mask = match decoder_attention_mask {
            Some(m) if cache_len == 0 => m.clone(),
            _ => create_full_attention_mask(batch_size, dec_len),
        };

        let correction = self.bridge.forward(
            &encoder_hidden,
            Some(encoder_mask),
            &decoder_hidden,
            Some(&bridge_mask),
            Some(encoder_mask),
        )?;

        // 4. Residual combination, then the decoder's original head
        let combined = decoder_hidden + correction;
        let logits = self.decoder.project_to_logits(&combined)?;

        Ok(GrafomerOutput {
            logits,
            encoder_hidden_state: encoder_hidden,
        })
    }

    /// Once a running cache exists, only the last generated token is fed
    /// back; earlier positions are already reflected in the cached state.
    pub fn prepare_inputs_for_generation(
        &self,
        decoder_input_ids: &Array2<u32>,
        cache: &dyn Cache,
    ) -> Array2<u32> {
        if cache.get_seq_length() > 0 {
            let last = decoder_input_ids.ncols() - 1;
            decoder_input_ids.slice(s![.., last..]).to_owned()
        } else {
            decoder_input_ids.clone()
        }
    }

    /// Synchronous greedy decoding with incremental caching. Returns the
    /// generated ids per batch row (start token excluded), stopping at
    /// `max_new_tokens` or when every row has emitted `eos_token_id`.
    pub fn generate_greedy(
        &self,
        input_ids: &Array2<u32>,
        attention_mask: Option<&Array2<f32>>,
        max_new_tokens: usize,
        eos_token_id: Option<u32>,
    ) -> Result<Vec<Vec<u32>>> {
        let batch_size = input_ids.nrows();

        let encoder_hidden = self.encoder.forward(Some(input_ids), None, attention_mask)?;

        let max_len = (max_new_tokens + 1).min(self.decoder.max_positions());
        let mut cache = self.decoder.new_cache(batch_size, max_len);

        let mut decoder_tokens =
            Array2::from_elem((batch_size, 1), self.decoder_start_token_id);
        let mut generated: Vec<Vec<u32>> = vec![Vec::new(); batch_size];
        let mut finished = vec![false; batch_size];

        for _ in 0..max_new_tokens {
            let step_inputs = self.prepare_inputs_for_generation(&decoder_tokens, cache.as_ref());
            let output = self.forward(
                None,
                attention_mask,
                Some(&step_inputs),
                None,
                Some(&encoder_hidden),
                Some(cache.as_mut()),
            )?;

            let last_logits = output.logits.index_axis(Axis(1), output.logits.shape()[1] - 1);
            let mut next_tokens = Vec::with_capacity(batch_size);
            for b in 0..batch_size {
                let row = last_logits.index_axis(Axis(0), b);
                let (argmax, _) = row.iter().enumerate().fold(
                    (0usize, f32::NEG_INFINITY),
                    |(best_i, best_v), (i, &v)| {
                        if v > best_v {
                            (i, v)
                        } else {
                            (best_i, best_v)
                        }
                    },
                );
                next_tokens.push(argmax as u32);
            }

            for (b, &token) in next_tokens.iter().enumerate() {
                if !finished[b] {
                    generated[b].push(token);
                    if eos_token_id == Some(token) {
                        finished[b] = true;
                    }
                }
            }

            if finished.iter().all(|&f| f) {
                break;
            }

            let next_column = Array2::from_shape_vec((batch_size, 1), next_tokens)?;
            decoder_tokens = ndarray::concatenate![Axis(1), decoder_tokens, next_column];
        }

        Ok(generated)
    }
}
