//! Fornax: a CPU inference engine for Llama-family transformer models.
//!
//! The engine processes one sequence position per [`StepEngine::step`] call
//! and stores the KV cache either in fixed-size physical blocks indirected
//! through per-request block tables ("paged attention") or in a single
//! contiguous buffer (comparison mode). Multi-request serving on top of the
//! single-sequence engine lives in the `fornax-runtime` crate.

pub mod block_pool;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod ops;
pub mod sampling;
pub mod tokenizer;
pub mod weights;

pub use block_pool::BlockPool;
pub use config::{BlockConfig, ModelConfig};
pub use engine::{AttentionMode, StepEngine};
pub use error::{Error, Result};
pub use kv_cache::SequenceCache;
pub use sampling::{Sampler, SamplingParams};
pub use tokenizer::Tokenizer;
pub use weights::{Model, ModelWeights};
