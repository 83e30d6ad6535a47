//! Shared fixtures: a tiny deterministically-initialised model, so tests
//! run hermetically without model files.
#![allow(dead_code)]

use fornax::config::ModelConfig;
use fornax::weights::{LayerWeights, Model, ModelWeights};

/// Deterministic small weights: xorshift-derived values in ~[-0.1, 0.1].
fn tensor(seed: &mut u64, elements: usize) -> Vec<f32> {
    (0..elements)
        .map(|_| {
            *seed ^= *seed << 13;
            *seed ^= *seed >> 7;
            *seed ^= *seed << 17;
            #[allow(clippy::cast_precision_loss)]
            let unit = (*seed % 10_000) as f32 / 10_000.0;
            (unit - 0.5) * 0.2
        })
        .collect()
}

/// A 2-layer GQA model small enough to step in microseconds.
#[must_use]
pub fn tiny_model() -> Model {
    tiny_model_with(ModelConfig {
        dim: 8,
        hidden_dim: 16,
        n_layers: 2,
        n_heads: 2,
        n_kv_heads: 1,
        vocab_size: 16,
        max_seq_len: 64,
        head_dim: 4,
        rope_theta: 10_000.0,
        eos_token_id: 2,
    })
}

/// Build a model with deterministic weights for an arbitrary configuration.
#[must_use]
pub fn tiny_model_with(config: ModelConfig) -> Model {
    let c = &config;
    let mut seed = 0x2545_f491_4f6c_dd1d;
    let qkv = c.n_heads * c.head_dim;

    let layers = (0..c.n_layers)
        .map(|_| LayerWeights {
            rms_att: vec![1.0; c.dim],
            wq: tensor(&mut seed, c.dim * qkv),
            wk: tensor(&mut seed, c.dim * c.kv_dim()),
            wv: tensor(&mut seed, c.dim * c.kv_dim()),
            wo: tensor(&mut seed, qkv * c.dim),
            rms_ffn: vec![1.0; c.dim],
            w_gate: tensor(&mut seed, c.dim * c.hidden_dim),
            w_up: tensor(&mut seed, c.dim * c.hidden_dim),
            w_down: tensor(&mut seed, c.hidden_dim * c.dim),
        })
        .collect();

    let token_embedding = tensor(&mut seed, c.vocab_size * c.dim);
    let weights = ModelWeights {
        lm_head: token_embedding.clone(),
        token_embedding,
        layers,
        rms_final: vec![1.0; c.dim],
        shared_weights: true,
    };
    Model::from_parts(config, weights).expect("tiny model is well-formed")
}
