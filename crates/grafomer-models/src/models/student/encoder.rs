//! BERT-shaped student encoder over synthesized projections.
//!
//! Dense projections are [`SynthesizedLinear`] instances keyed by their
//! structural role; layer norms, embeddings and the pooler are ordinary
//! freshly initialized parameters trained from scratch.

use anyhow::Result;
use ndarray::{Array2, Array3};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

use grafomer_transformers::activations::{apply_activation, tanh_scalar, Activation};
use grafomer_transformers::attention::{attend, CausalMode};
use grafomer_transformers::embeddings::Embeddings;
use grafomer_transformers::linear_layer::LinearLayer;
use grafomer_transformers::normalization::LayerNorm;
use grafomer_transformers::synthesis::{SynthesizedLinear, TeacherContext};
use grafomer_transformers::utils::masks::create_full_attention_mask;

use crate::models::student::config::StudentEncoderConfig;
use crate::models::resolve_input_shape;

#[derive(Debug)]
struct StudentSelfAttention {
    query: SynthesizedLinear,
    key: SynthesizedLinear,
    value: SynthesizedLinear,
    num_heads: usize,
    head_dim: usize,
}

impl StudentSelfAttention {
    fn new(
        context: &TeacherContext,
        layer_index: usize,
        config: &StudentEncoderConfig,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let n = config.num_hidden_layers;
        let linear = |role: &str| SynthesizedLinear::new(context, role, layer_index, n, h, h);

        Ok(Self {
            query: linear("encoder.attention.self.query")?,
            key: linear("encoder.attention.self.key")?,
            value: linear("encoder.attention.self.value")?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let q = self.query.forward(hidden_states)?;
        let k = self.key.forward(hidden_states)?;
        let v = self.value.forward(hidden_states)?;

        attend(
            &q,
            &k,
            &v,
            self.num_heads,
            self.head_dim,
            attention_mask,
            CausalMode::Off,
        )
    }
}

/// Attention output projection + residual + norm.
#[derive(Debug)]
struct StudentSelfOutput {
    dense: SynthesizedLinear,
    layer_norm: LayerNorm,
}

impl StudentSelfOutput {
    fn forward(&self, hidden_states: &Array3<f32>, input_tensor: &Array3<f32>) -> Result<Array3<f32>> {
        let projected = self.dense.forward(hidden_states)?;
        Ok(self.layer_norm.forward_3d(&(projected + input_tensor)))
    }
}

#[derive(Debug)]
struct StudentFeedForward {
    intermediate: SynthesizedLinear,
    output: SynthesizedLinear,
    layer_norm: LayerNorm,
    activation: Activation,
}

impl StudentFeedForward {
    fn forward(&self, attention_output: &Array3<f32>) -> Result<Array3<f32>> {
        let mut intermediate = self.intermediate.forward(attention_output)?;
        apply_activation(&mut intermediate, self.activation);
        let output = self.output.forward(&intermediate)?;
        Ok(self.layer_norm.forward_3d(&(output + attention_output)))
    }
}

#[derive(Debug)]
struct StudentEncoderLayer {
    attention: StudentSelfAttention,
    attention_output: StudentSelfOutput,
    feedforward: StudentFeedForward,
}

impl StudentEncoderLayer {
    fn new(
        context: &TeacherContext,
        layer_index: usize,
        config: &StudentEncoderConfig,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let inter = config.intermediate_size;
        let n = config.num_hidden_layers;

        Ok(Self {
            attention: StudentSelfAttention::new(context, layer_index, config)?,
            attention_output: StudentSelfOutput {
                dense: SynthesizedLinear::new(
                    context,
                    "encoder.attention.output.dense",
                    layer_index,
                    n,
                    h,
                    h,
                )?,
                layer_norm: LayerNorm::identity(h, config.layer_norm_eps),
            },
            feedforward: StudentFeedForward {
                intermediate: SynthesizedLinear::new(
                    context,
                    "encoder.intermediate.dense",
                    layer_index,
                    n,
                    h,
                    inter,
                )?,
                output: SynthesizedLinear::new(
                    context,
                    "encoder.ffn.output.dense",
                    layer_index,
                    n,
                    inter,
                    h,
                )?,
                layer_norm: LayerNorm::identity(h, config.layer_norm_eps),
                activation: config.activation(),
            },
        })
    }

    fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let context = self.attention.forward(hidden_states, attention_mask)?;
        let attention_output = self.attention_output.forward(&context, hidden_states)?;
        self.feedforward.forward(&attention_output)
    }
}

#[derive(Debug)]
pub struct StudentEncoder {
    embeddings: Embeddings,
    embeddings_layer_norm: LayerNorm,
    layers: Vec<StudentEncoderLayer>,
    pooler: LinearLayer,
    config: StudentEncoderConfig,
}

impl StudentEncoder {
    /// Builds the whole stack against one teacher context. Every layer
    /// index maps to its own contiguous teacher slice; all synthesis
    /// groups are validated here, before any forward pass.
    pub fn new(context: &TeacherContext, config: StudentEncoderConfig) -> Result<Self> {
        log::info!(
            "building student encoder: {} layers synthesized from teacher",
            config.num_hidden_layers
        );

        let init =
            Normal::new(0.0f32, config.initializer_range).map_err(|e| anyhow::anyhow!(e))?;
        let sample2 = |rows: usize, cols: usize| Array2::random((rows, cols), init);

        let embeddings = Embeddings::new(
            sample2(config.vocab_size, config.hidden_size),
            Some(sample2(config.max_position_embeddings, config.hidden_size)),
            Some(sample2(config.type_vocab_size, config.hidden_size)),
        );

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(StudentEncoderLayer::new(context, i, &config)?);
        }

        Ok(Self {
            embeddings,
            embeddings_layer_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            pooler: LinearLayer::xavier(config.hidden_size, config.hidden_size),
            layers,
            config,
        })
    }

    pub fn config(&self) -> &StudentEncoderConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn forward(
        &self,
        input_ids: Option<&Array2<u32>>,
        inputs_embeds: Option<&Array3<f32>>,
        attention_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let (batch_size, seq_len) = resolve_input_shape(input_ids, inputs_embeds)?;

        let hidden = match (input_ids, inputs_embeds) {
            (Some(ids), _) => self.embeddings.forward(ids, None, 0),
            (None, Some(embeds)) => embeds.clone(),
            (None, None) => unreachable!("input contract validated above"),
        };
        let mut hidden = self.embeddings_layer_norm.forward_3d(&hidden);

        let owned_mask;
        let mask = match attention_mask {
            Some(m) => m,
            None => {
                owned_mask = create_full_attention_mask(batch_size, seq_len);
                &owned_mask
            }
        };

        for layer in &self.layers {
            hidden = layer.forward(&hidden, Some(mask))?;
        }

        Ok(hidden)
    }

    /// `[CLS]` pooling over the first token.
    pub fn pooled(&self, hidden_states: &Array3<f32>) -> Array2<f32> {
        let first_token = hidden_states.index_axis(ndarray::Axis(1), 0).to_owned();
        let mut pooled = self.pooler.matmul(&first_token.view());
        pooled.mapv_inplace(tanh_scalar);
        pooled
    }
}
