//! GPT-2 style pretrained decoder (body + LM head).

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{concatenate, s, Array2, Array3, Axis};

use grafomer_transformers::attention::MultiHeadAttention;
use grafomer_transformers::cache::{Cache, CpuKVCache};
use grafomer_transformers::embeddings::Embeddings;
use grafomer_transformers::feedforward::FeedForward;
use grafomer_transformers::linear_layer::LinearLayer;
use grafomer_transformers::normalization::LayerNorm;
use grafomer_transformers::synthesis::{TeacherContext, TeacherScope};
use grafomer_transformers::utils::masks::create_full_attention_mask;
use grafomer_transformers::weights::ModelWeights;

use crate::models::gpt2::config::Gpt2Config;
use crate::models::{resolve_input_shape, PretrainedDecoder};

/// A pre-norm GPT-2 block: `x + Attn(LN(x))`, then `x + FFN(LN(x))`.
pub struct Gpt2Block {
    pub ln_1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln_2: LayerNorm,
    pub mlp: FeedForward,
}

impl Gpt2Block {
    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array2<f32>>,
        past_kv: Option<(ndarray::ArrayView3<f32>, ndarray::ArrayView3<f32>)>,
    ) -> Result<(Array3<f32>, (Array3<f32>, Array3<f32>))> {
        let residual = hidden_states.clone();
        let normed = self.ln_1.forward_3d(hidden_states);
        let (attn_out, new_k, new_v) =
            self.attn
                .forward_with_cache(&normed, None, attention_mask, true, past_kv)?;
        let hidden = residual + attn_out;

        let residual = hidden.clone();
        let normed = self.ln_2.forward_3d(&hidden);
        let ffn_out = self.mlp.forward(&normed)?;

        Ok((residual + ffn_out, (new_k, new_v)))
    }
}

pub struct Gpt2DecoderModel {
    embeddings: Embeddings,
    blocks: Vec<Gpt2Block>,
    final_layer_norm: LayerNorm,
    lm_head: LinearLayer,
    config: Arc<Gpt2Config>,
}

impl Gpt2DecoderModel {
    pub fn from_pretrained(model_path: &Path) -> Result<Self> {
        let weights = ModelWeights::new(model_path)?;
        let config = Arc::new(Gpt2Config::from_json(weights.config_json())?);
        Self::from_weights(&weights, config)
    }

    pub fn from_weights(weights: &ModelWeights, config: Arc<Gpt2Config>) -> Result<Self> {
        log::info!(
            "building GPT-2 decoder: {} layers, hidden size {}",
            config.n_layer,
            config.n_embd
        );

        let word_embeddings = weights.get_array2("wte.weight")?;
        let embeddings = Embeddings::new(
            word_embeddings.clone(),
            Some(weights.get_array2("wpe.weight")?),
            None,
        );

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Self::build_block(weights, &config, i)?);
        }

        let final_layer_norm =
            LayerNorm::from_weights(weights, "ln_f.weight", "ln_f.bias", config.layer_norm_epsilon)?;

        // GPT-2 ties the LM head to the token embedding table.
        let lm_head = LinearLayer::new(word_embeddings, None);

        Ok(Self {
            embeddings,
            blocks,
            final_layer_norm,
            lm_head,
            config,
        })
    }

    /// GPT-2 checkpoints store Conv1D weights in `[In, Out]` layout, with
    /// Q/K/V fused into one `c_attn` tensor; both are undone here.
    fn build_block(weights: &ModelWeights, config: &Gpt2Config, layer_idx: usize) -> Result<Gpt2Block> {
        log::debug!("  loading decoder block {}", layer_idx);
        let hidden_size = config.n_embd;
        let name = |suffix: &str| config.layer_name(layer_idx, suffix);

        let qkv_weight = weights.get_array2(&name("attn.c_attn.weight"))?;
        let qkv_bias = weights.get_array1(&name("attn.c_attn.bias"))?;
        if qkv_weight.dim() != (hidden_size, 3 * hidden_size) {
            return Err(anyhow!(
                "fused c_attn weight in layer {} has shape {:?}, expected [{}, {}]",
                layer_idx,
                qkv_weight.shape(),
                hidden_size,
                3 * hidden_size
            ));
        }

        let column_block = |start: usize| {
            let weight = qkv_weight
                .slice(s![.., start..start + hidden_size])
                .t()
                .as_standard_layout()
                .to_owned();
            let bias = qkv_bias.slice(s![start..start + hidden_size]).to_owned();
            LinearLayer::new(weight, bias)
        };

        let o_weight = weights
            .get_array2(&name("attn.c_proj.weight"))?
            .t()
            .as_standard_layout()
            .to_owned();
        let o_bias = weights.get_array1(&name("attn.c_proj.bias"))?;

        let attn = MultiHeadAttention::new(
            hidden_size,
            config.n_head,
            column_block(0),
            column_block(hidden_size),
            column_block(2 * hidden_size),
            LinearLayer::new(o_weight, o_bias),
        )?;

        let fc1_weight = weights
            .get_array2(&name("mlp.c_fc.weight"))?
            .t()
            .as_standard_layout()
            .to_owned();
        let fc2_weight = weights
            .get_array2(&name("mlp.c_proj.weight"))?
            .t()
            .as_standard_layout()
            .to_owned();
        let mlp = FeedForward::new(
            LinearLayer::new(fc1_weight, weights.get_array1(&name("mlp.c_fc.bias"))?),
            LinearLayer::new(fc2_weight, weights.get_array1(&name("mlp.c_proj.bias"))?),
            config.activation(),
        );

        Ok(Gpt2Block {
            ln_1: LayerNorm::from_weights(
                weights,
                &name("ln_1.weight"),
                &name("ln_1.bias"),
                config.layer_norm_epsilon,
            )?,
            attn,
            ln_2: LayerNorm::from_weights(
                weights,
                &name("ln_2.weight"),
                &name("ln_2.bias"),
                config.layer_norm_epsilon,
            )?,
            mlp,
        })
    }

    pub fn config(&self) -> &Arc<Gpt2Config> {
        &self.config
    }

    /// Registers this decoder's per-layer dense parameters into a teacher
    /// context under the `decoder` scope, re-fusing Q/K/V into the `c_attn`
    /// form the checkpoint (and the student's fused projection) uses.
    pub fn register_teacher_parameters(&self, context: &mut TeacherContext) {
        for (i, block) in self.blocks.iter().enumerate() {
            let fused_weight = concatenate![
                Axis(0),
                block.attn.query.weight.view(),
                block.attn.key.weight.view(),
                block.attn.value.weight.view()
            ];
            context.register_matrix(
                TeacherScope::Decoder,
                self.config.layer_name(i, "attn.c_attn.weight"),
                fused_weight,
            );

            let bias_view = |l: &LinearLayer| match &l.bias {
                Some(b) => b.clone(),
                None => ndarray::Array1::zeros(l.out_features()),
            };
            let fused_bias = concatenate![
                Axis(0),
                bias_view(&block.attn.query).view(),
                bias_view(&block.attn.key).view(),
                bias_view(&block.attn.value).view()
            ];
            context.register_vector(
                TeacherScope::Decoder,
                self.config.layer_name(i, "attn.c_attn.bias"),
                fused_bias,
            );

            let mut register = |suffix: &str, l: &LinearLayer| {
                context.register_matrix(
                    TeacherScope::Decoder,
                    self.config.layer_name(i, &format!("{}.weight", suffix)),
                    l.weight.clone(),
                );
                if let Some(b) = &l.bias {
                    context.register_vector(
                        TeacherScope::Decoder,
                        self.config.layer_name(i, &format!("{}.bias", suffix)),
                        b.clone(),
                    );
                }
            };
            register("attn.c_proj", &block.attn.output);
            register("mlp.c_fc", block.mlp.fc1());
            register("mlp.c_proj", block.mlp.fc2());
        }
    }
}

impl PretrainedDecoder for Gpt2DecoderModel {
    fn forward_body(
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

        Ok(self.final_layer_norm.forward_3d(&hidden))
    }

    fn project_to_logits(&self, hidden_states: &Array3<f32>) -> Result<Array3<f32>> {
        Ok(self.lm_head.forward(hidden_states))
    }

    fn hidden_size(&self) -> usize {
        self.config.n_embd
    }

    fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.config.n_ctx
    }

    fn new_cache(&self, batch_size: usize, max_len: usize) -> Box<dyn Cache> {
        Box::new(CpuKVCache::new(
            self.num_layers(),
            batch_size,
            max_len,
            self.hidden_size(),
        ))
    }
}
