//! Shared fixtures: tiny deterministic checkpoints and teacher contexts.

use std::collections::HashMap;

use ndarray::{Array1, Array2};
use safetensors::tensor::{Dtype, TensorView};
use tempfile::TempDir;

use grafomer_transformers::synthesis::{TeacherContext, TeacherScope};

/// Deterministic small-magnitude fill so forwards stay finite.
fn pattern(rows: usize, cols: usize, seed: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        (((seed * 31 + i * 7 + j * 3) % 23) as f32 - 11.0) * 0.01
    })
}

fn pattern_vec(len: usize, seed: usize) -> Array1<f32> {
    Array1::from_shape_fn(len, |i| (((seed * 17 + i * 5) % 19) as f32 - 9.0) * 0.01)
}

struct TensorFile {
    entries: Vec<(String, Vec<usize>, Vec<f32>)>,
}

impl TensorFile {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push2(&mut self, name: &str, arr: Array2<f32>) {
        let shape = arr.shape().to_vec();
        self.entries
            .push((name.to_string(), shape, arr.into_raw_vec_and_offset().0));
    }

    fn push1(&mut self, name: &str, arr: Array1<f32>) {
        let shape = arr.shape().to_vec();
        self.entries
            .push((name.to_string(), shape, arr.into_raw_vec_and_offset().0));
    }

    fn write(self, dir: &TempDir, config_json: &str) {
        let stored: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .entries
            .into_iter()
            .map(|(name, shape, values)| {
                let bytes = values.iter().flat_map(|f| f.to_le_bytes()).collect();
                (name, shape, bytes)
            })
            .collect();

        let mut tensor_map = HashMap::new();
        for (name, shape, bytes) in &stored {
            tensor_map.insert(
                name.clone(),
                TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
            );
        }

        safetensors::serialize_to_file(
            &tensor_map,
            &None,
            &dir.path().join("model.safetensors"),
        )
        .unwrap();
        std::fs::write(dir.path().join("config.json"), config_json).unwrap();
    }
}

/// Writes a tiny BERT-style checkpoint directory.
pub fn tiny_bert_dir(
    num_layers: usize,
    hidden: usize,
    heads: usize,
    intermediate: usize,
    vocab: usize,
    max_positions: usize,
) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut file = TensorFile::new();

    file.push2("embeddings.word_embeddings.weight", pattern(vocab, hidden, 1));
    file.push2(
        "embeddings.position_embeddings.weight",
        pattern(max_positions, hidden, 2),
    );
    file.push2("embeddings.token_type_embeddings.weight", pattern(2, hidden, 3));
    file.push1("embeddings.LayerNorm.weight", Array1::ones(hidden));
    file.push1("embeddings.LayerNorm.bias", Array1::zeros(hidden));

    for i in 0..num_layers {
        let name = |suffix: &str| format!("encoder.layer.{}.{}", i, suffix);
        for (j, part) in ["query", "key", "value"].iter().enumerate() {
            file.push2(
                &name(&format!("attention.self.{}.weight", part)),
                pattern(hidden, hidden, 10 + i * 10 + j),
            );
            file.push1(
                &name(&format!("attention.self.{}.bias", part)),
                pattern_vec(hidden, 10 + i * 10 + j),
            );
        }
        file.push2(
            &name("attention.output.dense.weight"),
            pattern(hidden, hidden, 20 + i),
        );
        file.push1(&name("attention.output.dense.bias"), pattern_vec(hidden, 20 + i));
        file.push1(&name("attention.output.LayerNorm.weight"), Array1::ones(hidden));
        file.push1(&name("attention.output.LayerNorm.bias"), Array1::zeros(hidden));

        file.push2(
            &name("intermediate.dense.weight"),
            pattern(intermediate, hidden, 30 + i),
        );
        file.push1(
            &name("intermediate.dense.bias"),
            pattern_vec(intermediate, 30 + i),
        );
        file.push2(&name("output.dense.weight"), pattern(hidden, intermediate, 40 + i));
        file.push1(&name("output.dense.bias"), pattern_vec(hidden, 40 + i));
        file.push1(&name("output.LayerNorm.weight"), Array1::ones(hidden));
        file.push1(&name("output.LayerNorm.bias"), Array1::zeros(hidden));
    }

    file.push2("pooler.dense.weight", pattern(hidden, hidden, 50));
    file.push1("pooler.dense.bias", pattern_vec(hidden, 50));

    let config = format!(
        r#"{{
            "vocab_size": {vocab},
            "hidden_size": {hidden},
            "num_hidden_layers": {num_layers},
            "num_attention_heads": {heads},
            "intermediate_size": {intermediate},
            "max_position_embeddings": {max_positions},
            "type_vocab_size": 2,
            "model_type": "bert"
        }}"#
    );
    file.write(&dir, &config);
    dir
}

/// Writes a tiny GPT-2-style checkpoint directory (Conv1D `[In, Out]`
/// layouts, fused QKV).
pub fn tiny_gpt2_dir(
    num_layers: usize,
    hidden: usize,
    heads: usize,
    intermediate: usize,
    vocab: usize,
    max_positions: usize,
) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut file = TensorFile::new();

    file.push2("wte.weight", pattern(vocab, hidden, 61));
    file.push2("wpe.weight", pattern(max_positions, hidden, 62));

    for i in 0..num_layers {
        let name = |suffix: &str| format!("h.{}.{}", i, suffix);

        file.push1(&name("ln_1.weight"), Array1::ones(hidden));
        file.push1(&name("ln_1.bias"), Array1::zeros(hidden));
        file.push2(
            &name("attn.c_attn.weight"),
            pattern(hidden, 3 * hidden, 70 + i),
        );
        file.push1(&name("attn.c_attn.bias"), pattern_vec(3 * hidden, 70 + i));
        file.push2(&name("attn.c_proj.weight"), pattern(hidden, hidden, 80 + i));
        file.push1(&name("attn.c_proj.bias"), pattern_vec(hidden, 80 + i));

        file.push1(&name("ln_2.weight"), Array1::ones(hidden));
        file.push1(&name("ln_2.bias"), Array1::zeros(hidden));
        file.push2(&name("mlp.c_fc.weight"), pattern(hidden, intermediate, 90 + i));
        file.push1(&name("mlp.c_fc.bias"), pattern_vec(intermediate, 90 + i));
        file.push2(
            &name("mlp.c_proj.weight"),
            pattern(intermediate, hidden, 100 + i),
        );
        file.push1(&name("mlp.c_proj.bias"), pattern_vec(hidden, 100 + i));
    }

    file.push1("ln_f.weight", Array1::ones(hidden));
    file.push1("ln_f.bias", Array1::zeros(hidden));

    let config = format!(
        r#"{{
            "vocab_size": {vocab},
            "n_ctx": {max_positions},
            "n_embd": {hidden},
            "n_layer": {num_layers},
            "n_head": {heads},
            "n_inner": {intermediate},
            "layer_norm_epsilon": 1e-5,
            "model_type": "gpt2"
        }}"#
    );
    file.write(&dir, &config);
    dir
}

/// A synthetic teacher context covering every role the student stacks use,
/// with `num_layers` teacher layers in both scopes.
pub fn student_teacher_context(
    num_layers: usize,
    hidden: usize,
    intermediate: usize,
) -> TeacherContext {
    let mut ctx = TeacherContext::new();

    for i in 0..num_layers {
        // Encoder scope (BERT-shaped roles)
        let enc = |suffix: &str| format!("layer.{}.{}", i, suffix);
        for (j, part) in ["query", "key", "value"].iter().enumerate() {
            ctx.register_matrix(
                TeacherScope::Encoder,
                enc(&format!("attention.self.{}.weight", part)),
                pattern(hidden, hidden, 200 + i * 10 + j),
            );
            ctx.register_vector(
                TeacherScope::Encoder,
                enc(&format!("attention.self.{}.bias", part)),
                pattern_vec(hidden, 200 + i * 10 + j),
            );
        }
        ctx.register_matrix(
            TeacherScope::Encoder,
            enc("attention.output.dense.weight"),
            pattern(hidden, hidden, 210 + i),
        );
        ctx.register_vector(
            TeacherScope::Encoder,
            enc("attention.output.dense.bias"),
            pattern_vec(hidden, 210 + i),
        );
        ctx.register_matrix(
            TeacherScope::Encoder,
            enc("intermediate.dense.weight"),
            pattern(intermediate, hidden, 220 + i),
        );
        ctx.register_vector(
            TeacherScope::Encoder,
            enc("intermediate.dense.bias"),
            pattern_vec(intermediate, 220 + i),
        );
        ctx.register_matrix(
            TeacherScope::Encoder,
            enc("ffn.output.dense.weight"),
            pattern(hidden, intermediate, 230 + i),
        );
        ctx.register_vector(
            TeacherScope::Encoder,
            enc("ffn.output.dense.bias"),
            pattern_vec(hidden, 230 + i),
        );

        // Decoder scope (GPT-2-shaped roles, fused QKV already in [Out, In])
        let dec = |suffix: &str| format!("h.{}.{}", i, suffix);
        ctx.register_matrix(
            TeacherScope::Decoder,
            dec("attn.c_attn.weight"),
            pattern(3 * hidden, hidden, 240 + i),
        );
        ctx.register_vector(
            TeacherScope::Decoder,
            dec("attn.c_attn.bias"),
            pattern_vec(3 * hidden, 240 + i),
        );
        ctx.register_matrix(
            TeacherScope::Decoder,
            dec("attn.c_proj.weight"),
            pattern(hidden, hidden, 250 + i),
        );
        ctx.register_vector(
            TeacherScope::Decoder,
            dec("attn.c_proj.bias"),
            pattern_vec(hidden, 250 + i),
        );
        ctx.register_matrix(
            TeacherScope::Decoder,
            dec("mlp.c_fc.weight"),
            pattern(intermediate, hidden, 260 + i),
        );
        ctx.register_vector(
            TeacherScope::Decoder,
            dec("mlp.c_fc.bias"),
            pattern_vec(intermediate, 260 + i),
        );
        ctx.register_matrix(
            TeacherScope::Decoder,
            dec("mlp.c_proj.weight"),
            pattern(hidden, intermediate, 270 + i),
        );
        ctx.register_vector(
            TeacherScope::Decoder,
            dec("mlp.c_proj.bias"),
            pattern_vec(hidden, 270 + i),
        );
    }

    ctx
}
