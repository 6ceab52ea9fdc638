//! BERT-style pretrained encoder.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use ndarray::{s, Array2, Array3, Axis};

use grafomer_transformers::activations::tanh_scalar;
use grafomer_transformers::attention::MultiHeadAttention;
use grafomer_transformers::embeddings::Embeddings;
use grafomer_transformers::encoder::{forward_encoder_layers, EncoderLayer};
use grafomer_transformers::feedforward::FeedForward;
use grafomer_transformers::linear_layer::LinearLayer;
use grafomer_transformers::normalization::LayerNorm;
use grafomer_transformers::synthesis::{TeacherContext, TeacherScope};
use grafomer_transformers::utils::masks::create_full_attention_mask;
use grafomer_transformers::weights::ModelWeights;

use crate::models::bert::config::BertConfig;
use crate::models::{resolve_input_shape, PretrainedEncoder};

#[derive(Debug)]
pub struct BertEncoderModel {
    embeddings: Embeddings,
    embeddings_layer_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    pooler: Option<LinearLayer>,
    config: Arc<BertConfig>,
}

impl BertEncoderModel {
    /// Loads `config.json` + `model.safetensors` from a model directory.
    pub fn from_pretrained(model_path: &Path) -> Result<Self> {
        let weights = ModelWeights::new(model_path)?;
        let config = Arc::new(BertConfig::from_json(weights.config_json())?);
        Self::from_weights(&weights, config)
    }

    pub fn from_weights(weights: &ModelWeights, config: Arc<BertConfig>) -> Result<Self> {
        log::info!(
            "building BERT encoder: {} layers, hidden size {}",
            config.num_hidden_layers,
            config.hidden_size
        );

        let embeddings = Embeddings::new(
            weights.get_array2("embeddings.word_embeddings.weight")?,
            Some(weights.get_array2("embeddings.position_embeddings.weight")?),
            Some(weights.get_array2("embeddings.token_type_embeddings.weight")?),
        );
        let embeddings_layer_norm = LayerNorm::from_weights(
            weights,
            "embeddings.LayerNorm.weight",
            "embeddings.LayerNorm.bias",
            config.layer_norm_eps,
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Self::build_layer(weights, &config, i)?);
        }

        let pooler = if weights.contains("pooler.dense.weight") {
            Some(LinearLayer::from_weights(
                weights,
                "pooler.dense.weight",
                Some("pooler.dense.bias"),
            )?)
        } else {
            None
        };

        Ok(Self {
            embeddings,
            embeddings_layer_norm,
            layers,
            pooler,
            config,
        })
    }

    fn build_layer(
        weights: &ModelWeights,
        config: &BertConfig,
        layer_idx: usize,
    ) -> Result<EncoderLayer> {
        log::debug!("  loading encoder layer {}", layer_idx);
        let name = |suffix: &str| config.layer_name(layer_idx, suffix);
        let linear = |prefix: &str| {
            LinearLayer::from_weights(
                weights,
                &name(&format!("{}.weight", prefix)),
                Some(&name(&format!("{}.bias", prefix))),
            )
        };

        let self_attn = MultiHeadAttention::new(
            config.hidden_size,
            config.num_attention_heads,
            linear("attention.self.query")?,
            linear("attention.self.key")?,
            linear("attention.self.value")?,
            linear("attention.output.dense")?,
        )?;

        let feedforward = FeedForward::new(
            linear("intermediate.dense")?,
            linear("output.dense")?,
            config.activation(),
        );

        Ok(EncoderLayer {
            self_attn,
            self_attn_layer_norm: LayerNorm::from_weights(
                weights,
                &name("attention.output.LayerNorm.weight"),
                &name("attention.output.LayerNorm.bias"),
                config.layer_norm_eps,
            )?,
            feedforward,
            ffn_layer_norm: LayerNorm::from_weights(
                weights,
                &name("output.LayerNorm.weight"),
                &name("output.LayerNorm.bias"),
                config.layer_norm_eps,
            )?,
        })
    }

    pub fn config(&self) -> &Arc<BertConfig> {
        &self.config
    }

    /// `[CLS]` pooling: dense + tanh over the first token.
    pub fn pooled(&self, hidden_states: &Array3<f32>) -> Option<Array2<f32>> {
        let pooler = self.pooler.as_ref()?;
        let first_token = hidden_states.slice(s![.., 0, ..]).to_owned();
        let mut pooled = pooler.matmul(&first_token.view());
        pooled.mapv_inplace(tanh_scalar);
        Some(pooled)
    }

    /// Registers this encoder's per-layer dense parameters into a teacher
    /// context, in ascending layer order, under the `encoder` scope.
    pub fn register_teacher_parameters(&self, context: &mut TeacherContext) {
        for (i, layer) in self.layers.iter().enumerate() {
            let mut matrix = |suffix: &str, l: &LinearLayer| {
                context.register_matrix(
                    TeacherScope::Encoder,
                    self.config.layer_name(i, suffix),
                    l.weight.clone(),
                );
                if let Some(bias) = &l.bias {
                    context.register_vector(
                        TeacherScope::Encoder,
                        self.config
                            .layer_name(i, &suffix.replace(".weight", ".bias")),
                        bias.clone(),
                    );
                }
            };

            matrix("attention.self.query.weight", &layer.self_attn.query);
            matrix("attention.self.key.weight", &layer.self_attn.key);
            matrix("attention.self.value.weight", &layer.self_attn.value);
            matrix("attention.output.dense.weight", &layer.self_attn.output);
            matrix("intermediate.dense.weight", layer.feedforward.fc1());
            // Registered as `ffn.output.dense` rather than the checkpoint's
            // `output.dense`, which is a substring of `attention.output.dense`
            // and would make the role ambiguous under contains-matching.
            matrix("ffn.output.dense.weight", layer.feedforward.fc2());
        }
    }

    fn embed(
        &self,
        input_ids: Option<&Array2<u32>>,
        inputs_embeds: Option<&Array3<f32>>,
        seq_len: usize,
    ) -> Array3<f32> {
        let hidden = match (input_ids, inputs_embeds) {
            (Some(ids), _) => self.embeddings.forward(ids, None, 0),
            (None, Some(embeds)) => {
                // Pre-embedded inputs still receive position and segment
                // embeddings, as the token path does.
                let mut hidden = embeds.clone();
                if let Some(pos) = &self.embeddings.position_embeddings {
                    let pos_slice = pos.slice(s![0..seq_len, ..]);
                    hidden += &pos_slice.insert_axis(Axis(0));
                }
                if let Some(types) = &self.embeddings.token_type_embeddings {
                    hidden += &types.row(0);
                }
                hidden
            }
            (None, None) => unreachable!("input contract validated by caller"),
        };
        self.embeddings_layer_norm.forward_3d(&hidden)
    }
}

impl PretrainedEncoder for BertEncoderModel {
    fn forward(
        &self,
        input_ids: Option<&Array2<u32>>,
        inputs_embeds: Option<&Array3<f32>>,
        attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let (batch_size, seq_len) = resolve_input_shape(input_ids, inputs_embeds)?;

        let hidden = self.embed(input_ids, inputs_embeds, seq_len);

        let owned_mask;
        let mask = match attention_mask {
            Some(m) => m,
            None => {
                owned_mask = create_full_attention_mask(batch_size, seq_len);
                &owned_mask
            }
        };

        let output = forward_encoder_layers(&self.layers, &hidden, Some(mask), false)?;
        Ok(output.last_hidden_state)
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_fixtures::tiny_bert_dir;
    use grafomer_transformers::error::InputContractError;
    use ndarray::Array2;

    #[test]
    fn test_from_pretrained_and_forward() {
        let dir = tiny_bert_dir(2, 16, 2, 32, 8, 64);
        let model = BertEncoderModel::from_pretrained(dir.path()).unwrap();

        assert_eq!(model.hidden_size(), 16);

        let ids = Array2::from_shape_fn((2, 5), |(b, s)| ((b * 5 + s) % 8) as u32);
        let hidden = model.forward(Some(&ids), None, None).unwrap();

        assert_eq!(hidden.dim(), (2, 5, 16));
        assert!(hidden.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_input_contract_enforced() {
        let dir = tiny_bert_dir(1, 16, 2, 32, 8, 64);
        let model = BertEncoderModel::from_pretrained(dir.path()).unwrap();

        let ids = Array2::<u32>::zeros((1, 3));
        let embeds = Array3::<f32>::zeros((1, 3, 16));

        let err = model
            .forward(Some(&ids), Some(&embeds), None)
            .unwrap_err();
        assert!(err.downcast_ref::<InputContractError>().is_some());

        let err = model.forward(None, None, None).unwrap_err();
        assert!(err.downcast_ref::<InputContractError>().is_some());
    }

    #[test]
    fn test_pooler_output_bounded() {
        let dir = tiny_bert_dir(1, 16, 2, 32, 8, 64);
        let model = BertEncoderModel::from_pretrained(dir.path()).unwrap();

        let ids = Array2::from_shape_fn((2, 4), |(b, s)| (b + s) as u32);
        let hidden = model.forward(Some(&ids), None, None).unwrap();
        let pooled = model.pooled(&hidden).unwrap();

        assert_eq!(pooled.dim(), (2, 16));
        assert!(pooled.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_teacher_registration_order() {
        let dir = tiny_bert_dir(3, 16, 2, 32, 8, 64);
        let model = BertEncoderModel::from_pretrained(dir.path()).unwrap();

        let mut ctx = TeacherContext::new();
        model.register_teacher_parameters(&mut ctx);

        let queries = ctx.matrices_matching(TeacherScope::Encoder, "attention.self.query");
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0].dim(), (16, 16));
    }
}
