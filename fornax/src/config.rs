//! Model and paging configuration.

use crate::{Error, Result};

/// Architecture hyperparameters for a Llama-family model.
///
/// The first seven fields are read verbatim from the model file header;
/// `head_dim` is derived. Immutable after load.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Transformer (embedding) dimension.
    pub dim: usize,
    /// FFN hidden dimension.
    pub hidden_dim: usize,
    /// Number of transformer layers.
    pub n_layers: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads (< `n_heads` for grouped-query attention).
    pub n_kv_heads: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum sequence length the model supports.
    pub max_seq_len: usize,
    /// Per-head dimension (`dim / n_heads`).
    pub head_dim: usize,
    /// RoPE frequency base.
    pub rope_theta: f32,
    /// End-of-sequence token id. The llama2.c tokenizer format fixes this
    /// to 2; models trained with a different EOS can override it.
    pub eos_token_id: u32,
}

impl ModelConfig {
    /// Validate the derived relationships between fields.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the head counts or dimensions are
    /// inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(Error::Config(format!(
                "dim {} not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_kv_heads == 0 || self.n_heads % self.n_kv_heads != 0 {
            return Err(Error::Config(format!(
                "n_heads {} not divisible by n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim
            )));
        }
        Ok(())
    }

    /// Combined key/value width for one position (`n_kv_heads * head_dim`).
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }
}

/// Configuration for the block pool and paged KV cache.
#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    /// Number of tokens stored per block.
    pub block_size: usize,
    /// Total number of physical blocks in the pool.
    pub num_blocks: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ModelConfig {
        ModelConfig {
            dim: 64,
            hidden_dim: 128,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            vocab_size: 32,
            max_seq_len: 128,
            head_dim: 16,
            rope_theta: 10_000.0,
            eos_token_id: 2,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn gqa_ratio_must_divide() {
        let mut config = base_config();
        config.n_kv_heads = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn kv_dim() {
        assert_eq!(base_config().kv_dim(), 32);
    }
}
