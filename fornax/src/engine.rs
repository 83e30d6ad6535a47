//! Single-sequence transformer step engine.
//!
//! [`StepEngine::step`] performs one token-position of forward computation:
//! embedding, all transformer layers (attention reading and writing the KV
//! cache), final norm, and the classifier matmul into the logits buffer.
//! Batching across requests is done by the caller invoking `step` once per
//! batch member per iteration; the engine itself is strictly one sequence
//! position at a time and is not reentrant (it mutates shared scratch
//! buffers).
//!
//! The KV cache backend is chosen once at construction: paged (block pool +
//! block-table indirection) or contiguous (single flat cache, supported for
//! comparison runs with a single in-flight sequence).

use std::sync::Arc;

use tracing::debug;

use crate::block_pool::BlockPool;
use crate::config::BlockConfig;
use crate::kv_cache::{ContiguousKvStore, PagedKvStore, SequenceCache};
use crate::ops;
use crate::weights::Model;
use crate::{Error, Result};

/// KV cache strategy, resolved at engine construction.
#[derive(Debug, Clone, Copy)]
pub enum AttentionMode {
    /// Block-pooled KV cache with per-request block tables.
    Paged(BlockConfig),
    /// Single contiguous KV cache sized for `max_seq_len`.
    Contiguous,
}

enum CacheBackend {
    Paged {
        store: PagedKvStore,
        pool: Arc<BlockPool>,
    },
    Contiguous {
        store: ContiguousKvStore,
    },
}

/// Transient per-step scratch buffers.
///
/// These are engine-wide: concurrent `step` invocations are forbidden.
struct RunState {
    /// Residual stream.
    x: Vec<f32>,
    /// Normed activations / projection output.
    xb: Vec<f32>,
    /// Attention output.
    xb2: Vec<f32>,
    /// FFN gate branch.
    hb: Vec<f32>,
    /// FFN up branch.
    hb2: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    /// Attention scores, `[n_heads, max_seq_len]`.
    att: Vec<f32>,
    logits: Vec<f32>,
}

impl RunState {
    fn new(model: &Model) -> Self {
        let c = &model.config;
        Self {
            x: vec![0.0; c.dim],
            xb: vec![0.0; c.dim],
            xb2: vec![0.0; c.dim],
            hb: vec![0.0; c.hidden_dim],
            hb2: vec![0.0; c.hidden_dim],
            q: vec![0.0; c.n_heads * c.head_dim],
            k: vec![0.0; c.kv_dim()],
            v: vec![0.0; c.kv_dim()],
            att: vec![0.0; c.n_heads * c.max_seq_len],
            logits: vec![0.0; c.vocab_size],
        }
    }
}

/// One-token-at-a-time forward engine over a loaded model.
pub struct StepEngine {
    model: Model,
    state: RunState,
    cache: CacheBackend,
}

impl StepEngine {
    /// Create an engine with the given cache strategy.
    #[must_use]
    pub fn new(model: Model, mode: AttentionMode) -> Self {
        let state = RunState::new(&model);
        let cache = match mode {
            AttentionMode::Paged(block_config) => CacheBackend::Paged {
                store: PagedKvStore::new(&model.config, &block_config),
                pool: Arc::new(BlockPool::new(&block_config)),
            },
            AttentionMode::Contiguous => CacheBackend::Contiguous {
                store: ContiguousKvStore::new(&model.config),
            },
        };
        Self {
            model,
            state,
            cache,
        }
    }

    /// The model configuration.
    #[must_use]
    pub fn config(&self) -> &crate::ModelConfig {
        &self.model.config
    }

    /// The block pool, when running in paged mode.
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<BlockPool>> {
        match &self.cache {
            CacheBackend::Paged { pool, .. } => Some(pool),
            CacheBackend::Contiguous { .. } => None,
        }
    }

    /// Whether the engine runs the paged cache backend.
    #[must_use]
    pub fn is_paged(&self) -> bool {
        matches!(self.cache, CacheBackend::Paged { .. })
    }

    /// Logits produced by the most recent [`Self::step`].
    #[must_use]
    pub fn logits(&self) -> &[f32] {
        &self.state.logits
    }

    /// Mutable logits, for samplers that scale them in place.
    pub fn logits_mut(&mut self) -> &mut [f32] {
        &mut self.state.logits
    }

    /// Zero the KV cache and, in paged mode, return every block to the
    /// pool.
    ///
    /// Must run before the first iteration of a run, and never while
    /// requests still hold blocks they intend to read.
    pub fn reset_cache(&mut self) {
        debug!("resetting KV cache state");
        match &mut self.cache {
            CacheBackend::Paged { store, pool } => {
                store.reset();
                pool.reset();
            }
            CacheBackend::Contiguous { store } => store.reset(),
        }
    }

    /// Run one token-position of forward computation.
    ///
    /// Writes this position's K/V into the cache, attends over positions
    /// `0..=pos` of `seq`'s history, and fills the logits buffer. In paged
    /// mode a fresh block is allocated per layer whenever `pos` crosses a
    /// block boundary, recorded against `seq`'s request id.
    ///
    /// # Errors
    /// Returns [`Error::NoFreeBlocks`] if the pool is exhausted (the caller
    /// decides how to retire the sequence) and [`Error::SequenceOverflow`]
    /// if `pos` is past the model's maximum sequence length.
    pub fn step(&mut self, token: u32, pos: usize, seq: &mut SequenceCache) -> Result<()> {
        let c = &self.model.config;
        let w = &self.model.weights;
        let s = &mut self.state;

        if pos >= c.max_seq_len {
            return Err(Error::SequenceOverflow(pos));
        }

        let qkv_dim = c.n_heads * c.head_dim;
        let kv_dim = c.kv_dim();
        let num_tokens = pos + 1;

        // Token embedding into the residual stream.
        let row = &w.token_embedding[token as usize * c.dim..(token as usize + 1) * c.dim];
        s.x.copy_from_slice(row);

        for (layer, lw) in w.layers.iter().enumerate() {
            ops::rms_norm(&mut s.xb, &s.x, &lw.rms_att);

            ops::matmul(&mut s.q, &s.xb, &lw.wq, c.dim, qkv_dim);
            ops::matmul(&mut s.k, &s.xb, &lw.wk, c.dim, kv_dim);
            ops::matmul(&mut s.v, &s.xb, &lw.wv, c.dim, kv_dim);

            ops::apply_rope(
                &mut s.q,
                &mut s.k,
                pos,
                c.head_dim,
                c.n_heads,
                c.n_kv_heads,
                c.rope_theta,
            );

            match &mut self.cache {
                CacheBackend::Paged { store, pool } => {
                    if pos % store.block_size() == 0 {
                        let block_id = pool.allocate_one(seq.request_id())?;
                        seq.push_block(layer, block_id);
                    }

                    let table = seq.blocks(layer);
                    let physical_block = table[pos / store.block_size()];
                    store.write(
                        layer,
                        physical_block,
                        pos % store.block_size(),
                        &s.k,
                        &s.v,
                    );

                    let (k_pool, v_pool) = store.layer_pools(layer);
                    ops::paged_attention(
                        &mut s.xb2,
                        &s.q,
                        k_pool,
                        v_pool,
                        table,
                        &mut s.att,
                        num_tokens,
                        store.block_size(),
                        c.head_dim,
                        c.n_heads,
                        c.n_kv_heads,
                    );
                }
                CacheBackend::Contiguous { store } => {
                    store.write(layer, pos, &s.k, &s.v);
                    let (k_cache, v_cache) = store.layer_caches(layer);
                    ops::contiguous_attention(
                        &mut s.xb2,
                        &s.q,
                        k_cache,
                        v_cache,
                        &mut s.att,
                        num_tokens,
                        c.head_dim,
                        c.n_heads,
                        c.n_kv_heads,
                    );
                }
            }

            ops::matmul(&mut s.xb, &s.xb2, &lw.wo, qkv_dim, c.dim);
            for i in 0..c.dim {
                s.x[i] += s.xb[i];
            }

            ops::rms_norm(&mut s.xb, &s.x, &lw.rms_ffn);
            ops::matmul(&mut s.hb, &s.xb, &lw.w_gate, c.dim, c.hidden_dim);
            ops::matmul(&mut s.hb2, &s.xb, &lw.w_up, c.dim, c.hidden_dim);
            ops::swiglu(&mut s.hb, &s.hb2);
            ops::matmul(&mut s.xb, &s.hb, &lw.w_down, c.hidden_dim, c.dim);
            for i in 0..c.dim {
                s.x[i] += s.xb[i];
            }
        }

        ops::rms_norm(&mut s.xb, &s.x, &w.rms_final);
        ops::matmul(&mut s.logits, &s.xb, &w.lm_head, c.dim, c.vocab_size);

        Ok(())
    }
}
