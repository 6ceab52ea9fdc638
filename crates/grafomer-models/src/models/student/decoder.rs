//! GPT-2-shaped student decoder over synthesized projections.

use anyhow::Result;
use ndarray::{Array2, Array3, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

use grafomer_transformers::activations::{apply_activation, Activation};
use grafomer_transformers::attention::{attend, split_fused_qkv, CausalMode};
use grafomer_transformers::cache::{Cache, CpuKVCache};
use grafomer_transformers::embeddings::Embeddings;
use grafomer_transformers::linear_layer::LinearLayer;
use grafomer_transformers::normalization::LayerNorm;
use grafomer_transformers::synthesis::{SynthesizedLinear, TeacherContext};
use grafomer_transformers::utils::masks::{create_full_attention_mask, CausalMask};

use crate::models::student::config::StudentDecoderConfig;
use crate::models::resolve_input_shape;

/// Causal self-attention with a fused, synthesized QKV projection.
///
/// Causal visibility comes from a lower-triangular buffer sized to the
/// configured maximum position count, sliced to the live window per call.
#[derive(Debug)]
struct StudentDecoderAttention {
    c_attn: SynthesizedLinear,
    c_proj: SynthesizedLinear,
    causal_mask: CausalMask,
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,
}

impl StudentDecoderAttention {
    fn new(
        context: &TeacherContext,
        layer_index: usize,
        config: &StudentDecoderConfig,
    ) -> Result<Self> {
        let h = config.n_embd;
        let n = config.n_layer;

        Ok(Self {
            c_attn: SynthesizedLinear::new(context, "decoder.attn.c_attn", layer_index, n, h, 3 * h)?,
            c_proj: SynthesizedLinear::new(context, "decoder.attn.c_proj", layer_index, n, h, h)?,
            causal_mask: CausalMask::new(config.n_ctx),
            num_heads: config.n_head,
            head_dim: config.head_dim(),
            hidden_size: h,
        })
    }

    fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array2<f32>>,
        past_kv: Option<(ndarray::ArrayView3<f32>, ndarray::ArrayView3<f32>)>,
    ) -> Result<(Array3<f32>, (Array3<f32>, Array3<f32>))> {
        let fused = self.c_attn.forward(hidden_states)?;
        let (q, new_k, new_v) = split_fused_qkv(&fused, self.hidden_size);

        let cache_len = past_kv.as_ref().map_or(0, |(k, _)| k.shape()[1]);
        let (full_k, full_v) = if let Some((cached_k, cached_v)) = past_kv {
            let full_k = ndarray::concatenate![Axis(1), cached_k, new_k.view()]
                .as_standard_layout()
                .to_owned();
            let full_v = ndarray::concatenate![Axis(1), cached_v, new_v.view()]
                .as_standard_layout()
                .to_owned();
            (full_k, full_v)
        } else {
            (new_k.clone(), new_v.clone())
        };

        let context = attend(
            &q,
            &full_k,
            &full_v,
            self.num_heads,
            self.head_dim,
            attention_mask,
            CausalMode::Buffered {
                mask: &self.causal_mask,
                position_offset: cache_len,
            },
        )?;

        let output = self.c_proj.forward(&context)?;
        Ok((output, (new_k, new_v)))
    }
}

#[derive(Debug)]
struct StudentMlp {
    c_fc: SynthesizedLinear,
    c_proj: SynthesizedLinear,
    activation: Activation,
}

impl StudentMlp {
    fn new(
        context: &TeacherContext,
        layer_index: usize,
        config: &StudentDecoderConfig,
    ) -> Result<Self> {
        let h = config.n_embd;
        let inner = config.intermediate_size();
        let n = config.n_layer;

        Ok(Self {
            c_fc: SynthesizedLinear::new(context, "decoder.mlp.c_fc", layer_index, n, h, inner)?,
            c_proj: SynthesizedLinear::new(context, "decoder.mlp.c_proj", layer_index, n, inner, h)?,
            activation: config.activation(),
        })
    }

    fn forward(&self, hidden_states: &Array3<f32>) -> Result<Array3<f32>> {
        let mut hidden = self.c_fc.forward(hidden_states)?;
        apply_activation(&mut hidden, self.activation);
        self.c_proj.forward(&hidden)
    }
}

/// A pre-norm student block mirroring the GPT-2 layout.
#[derive(Debug)]
struct StudentDecoderBlock {
    ln_1: LayerNorm,
    attn: StudentDecoderAttention,
    ln_2: LayerNorm,
    mlp: StudentMlp,
}

impl StudentDecoderBlock {
    fn new(
        context: &TeacherContext,
        layer_index: usize,
        config: &StudentDecoderConfig,
    ) -> Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::identity(config.n_embd, config.layer_norm_epsilon),
            attn: StudentDecoderAttention::new(context, layer_index, config)?,
            ln_2: LayerNorm::identity(config.n_embd, config.layer_norm_epsilon),
            mlp: StudentMlp::new(context, layer_index, config)?,
        })
    }

    fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array2<f32>>,
        past_kv: Option<(ndarray::ArrayView3<f32>, ndarray::ArrayView3<f32>)>,
    ) -> Result<(Array3<f32>, (Array3<f32>, Array3<f32>))> {
        let residual = hidden_states.clone();
        let normed = self.ln_1.forward_3d(hidden_states);
        let (attn_out, kv) = self.attn.forward(&normed, attention_mask, past_kv)?;
        let hidden = residual + attn_out;

        let residual = hidden.clone();
        let normed = self.ln_2.forward_3d(&hidden);
        let mlp_out = self.mlp.forward(&normed)?;

        Ok((residual + mlp_out, kv))
    }
}

#[derive(Debug)]
pub struct StudentDecoder {
    embeddings: Embeddings,
    blocks: Vec<StudentDecoderBlock>,
    ln_f: LayerNorm,
    config: StudentDecoderConfig,
}

impl StudentDecoder {
    pub fn new(context: &TeacherContext, config: StudentDecoderConfig) -> Result<Self> {
        log::info!(
            "building student decoder: {} layers synthesized from teacher",
            config.n_layer
        );

        let init =
            Normal::new(0.0f32, config.initializer_range).map_err(|e| anyhow::anyhow!(e))?;
        let embeddings = Embeddings::new(
            Array2::random((config.vocab_size, config.n_embd), init),
            Some(Array2::random((config.n_ctx, config.n_embd), init)),
            None,
        );

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(StudentDecoderBlock::new(context, i, &config)?);
        }

        Ok(Self {
            embeddings,
            blocks,
            ln_f: LayerNorm::identity(config.n_embd, config.layer_norm_epsilon),
            config,
        })
    }

    pub fn config(&self) -> &StudentDecoderConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn new_cache(&self, batch_size: usize, max_len: usize) -> Box<dyn Cache> {
        Box::new(CpuKVCache::new(
            self.num_layers(),
            batch_size,
            max_len,
            self.config.n_embd,
        ))
    }

    pub fn forward(
        &self,
        input_ids: Option<&Array2<u32>>,
        inputs_embeds: Option<&Array3<f32>>,
        attention_mask: Option<&Array2<f32>>,
        mut cache: Option<&mut dyn Cache>,
    ) -> Result<Array3<f32>> {
        let (batch_size, seq_len) = resolve_input_shape(input_ids, inputs_embeds)?;

        let position_offset = cache.as_ref().map_or(0, |c| c.get_seq_length());

        let mut hidden = match (input_ids, inputs_embeds) {
            (Some(ids), _) => self.embeddings.forward(ids, None, position_offset),
            (None, Some(embeds)) => embeds.clone(),
            (None, None) => unreachable!("input contract validated above"),
        };

        let owned_mask;
        let mask = match attention_mask {
            Some(m) => m,
            None => {
                owned_mask = create_full_attention_mask(batch_size, position_offset + seq_len);
                &owned_mask
            }
        };

        let cpu_cache = cache
            .as_mut()
            .and_then(|c| c.as_any_mut().downcast_mut::<CpuKVCache>());

        match cpu_cache {
            Some(cpu_cache) => {
                let mut new_key_values = Vec::with_capacity(self.blocks.len());
                for (i, block) in self.blocks.iter().enumerate() {
                    let past = cpu_cache.get(i);
                    let past_views = past.as_ref().map(|(k, v)| (k.view(), v.view()));
                    let (new_hidden, kv) = block.forward(&hidden, Some(mask), past_views)?;
                    hidden = new_hidden;
                    new_key_values.push(kv);
                }
                for (i, (k, v)) in new_key_values.into_iter().enumerate() {
                    cpu_cache.update(i, &k, &v)?;
                }
                cpu_cache.increment_len(seq_len);
            }
            None => {
                for block in &self.blocks {
                    let (new_hidden, _) = block.forward(&hidden, Some(mask), None)?;
                    hidden = new_hidden;
                }
            }
        }

        Ok(self.ln_f.forward_3d(&hidden))
    }
}

/// Student decoder plus a trainable LM head.
pub struct StudentLmModel {
    decoder: StudentDecoder,
    lm_head: LinearLayer,
}

impl StudentLmModel {
    pub fn new(context: &TeacherContext, config: StudentDecoderConfig) -> Result<Self> {
        let lm_head = LinearLayer::xavier(config.vocab_size, config.n_embd);
        Ok(Self {
            decoder: StudentDecoder::new(context, config)?,
            lm_head,
        })
    }

    pub fn decoder(&self) -> &StudentDecoder {
        &self.decoder
    }

    pub fn forward(
        &self,
        input_ids: Option<&Array2<u32>>,
        inputs_embeds: Option<&Array3<f32>>,
        attention_mask: Option<&Array2<f32>>,
        cache: Option<&mut dyn Cache>,
    ) -> Result<Array3<f32>> {
        let hidden = self
            .decoder
            .forward(input_ids, inputs_embeds, attention_mask, cache)?;
        Ok(self.lm_head.forward(&hidden))
    }

    /// Same trimming rule as the grafted model: with a non-empty cache,
    /// only the last token goes back in.
    pub fn prepare_inputs_for_generation(
        &self,
        input_ids: &Array2<u32>,
        cache: &dyn Cache,
    ) -> Array2<u32> {
        if cache.get_seq_length() > 0 {
            let last = input_ids.ncols() - 1;
            input_ids.slice(ndarray::s![.., last..]).to_owned()
        } else {
            input_ids.clone()
        }
    }
}
