//! Key/value cache storage: paged and contiguous variants.
//!
//! The paged store holds one flat key buffer and one flat value buffer of
//! layout `[n_layers, num_blocks, block_size, n_kv_heads, head_dim]`; a
//! position is addressed through a per-request block table that maps logical
//! block index to physical block index. The contiguous store keeps the
//! classic `[n_layers, max_seq_len, n_kv_heads, head_dim]` layout and exists
//! for comparison runs.
//!
//! A position is written exactly once (single-sequence append) and read by
//! every later attention over that request's history; the stores expose raw
//! per-layer slices and leave the indexing arithmetic to the caller.

use crate::config::{BlockConfig, ModelConfig};

/// Paged KV storage shared by all requests.
pub struct PagedKvStore {
    keys: Vec<f32>,
    values: Vec<f32>,
    /// Elements per layer: `num_blocks * block_size * kv_dim`.
    layer_stride: usize,
    block_size: usize,
    kv_dim: usize,
}

impl PagedKvStore {
    /// Allocate zero-initialised pools for `config.n_layers` layers.
    #[must_use]
    pub fn new(config: &ModelConfig, block_config: &BlockConfig) -> Self {
        let kv_dim = config.kv_dim();
        let layer_stride = block_config.num_blocks * block_config.block_size * kv_dim;
        let total = config.n_layers * layer_stride;
        Self {
            keys: vec![0.0; total],
            values: vec![0.0; total],
            layer_stride,
            block_size: block_config.block_size,
            kv_dim,
        }
    }

    /// Write one position's key and value rows (`kv_dim` floats each) into
    /// `physical_block` at `block_offset` within `layer`.
    pub fn write(
        &mut self,
        layer: usize,
        physical_block: usize,
        block_offset: usize,
        k_row: &[f32],
        v_row: &[f32],
    ) {
        debug_assert_eq!(k_row.len(), self.kv_dim);
        debug_assert_eq!(v_row.len(), self.kv_dim);
        debug_assert!(block_offset < self.block_size);

        let offset = layer * self.layer_stride
            + (physical_block * self.block_size + block_offset) * self.kv_dim;
        self.keys[offset..offset + self.kv_dim].copy_from_slice(k_row);
        self.values[offset..offset + self.kv_dim].copy_from_slice(v_row);
    }

    /// Base key/value slices for one layer, as consumed by the paged
    /// attention kernel.
    #[must_use]
    pub fn layer_pools(&self, layer: usize) -> (&[f32], &[f32]) {
        let start = layer * self.layer_stride;
        let end = start + self.layer_stride;
        (&self.keys[start..end], &self.values[start..end])
    }

    /// Tokens per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Zero all storage.
    pub fn reset(&mut self) {
        self.keys.fill(0.0);
        self.values.fill(0.0);
    }
}

/// Contiguous KV storage for a single sequence (comparison mode).
pub struct ContiguousKvStore {
    keys: Vec<f32>,
    values: Vec<f32>,
    /// Elements per layer: `max_seq_len * kv_dim`.
    layer_stride: usize,
    kv_dim: usize,
}

impl ContiguousKvStore {
    /// Allocate zero-initialised caches sized for `config.max_seq_len`.
    #[must_use]
    pub fn new(config: &ModelConfig) -> Self {
        let kv_dim = config.kv_dim();
        let layer_stride = config.max_seq_len * kv_dim;
        let total = config.n_layers * layer_stride;
        Self {
            keys: vec![0.0; total],
            values: vec![0.0; total],
            layer_stride,
            kv_dim,
        }
    }

    /// Write one position's key and value rows at sequence position `pos`.
    pub fn write(&mut self, layer: usize, pos: usize, k_row: &[f32], v_row: &[f32]) {
        debug_assert_eq!(k_row.len(), self.kv_dim);
        let offset = layer * self.layer_stride + pos * self.kv_dim;
        self.keys[offset..offset + self.kv_dim].copy_from_slice(k_row);
        self.values[offset..offset + self.kv_dim].copy_from_slice(v_row);
    }

    /// Base key/value slices for one layer.
    #[must_use]
    pub fn layer_caches(&self, layer: usize) -> (&[f32], &[f32]) {
        let start = layer * self.layer_stride;
        let end = start + self.layer_stride;
        (&self.keys[start..end], &self.values[start..end])
    }

    /// Zero all storage.
    pub fn reset(&mut self) {
        self.keys.fill(0.0);
        self.values.fill(0.0);
    }
}

/// Per-request block tables: one ordered list of physical block ids per
/// layer. Logical block `i` of layer `l` lives in physical block
/// `tables[l][i]`.
#[derive(Debug, Clone)]
pub struct SequenceCache {
    request_id: u64,
    tables: Vec<Vec<usize>>,
}

impl SequenceCache {
    /// Create empty block tables for `n_layers` layers.
    #[must_use]
    pub fn new(request_id: u64, n_layers: usize) -> Self {
        Self {
            request_id,
            tables: vec![Vec::new(); n_layers],
        }
    }

    /// The owning request's id, used to record pool allocations.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Block table for one layer.
    #[must_use]
    pub fn blocks(&self, layer: usize) -> &[usize] {
        &self.tables[layer]
    }

    /// Append a newly allocated physical block to one layer's table.
    pub fn push_block(&mut self, layer: usize, block_id: usize) {
        self.tables[layer].push(block_id);
    }

    /// Number of blocks mapped for one layer.
    #[must_use]
    pub fn num_blocks(&self, layer: usize) -> usize {
        self.tables[layer].len()
    }

    /// Clear all tables (does not free pool blocks).
    pub fn clear(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 16,
            max_seq_len: 32,
            head_dim: 4,
            rope_theta: 10_000.0,
            eos_token_id: 2,
        }
    }

    #[test]
    fn paged_write_lands_at_block_offset() {
        let config = tiny_config();
        let block_config = BlockConfig {
            block_size: 4,
            num_blocks: 3,
        };
        let mut store = PagedKvStore::new(&config, &block_config);
        let kv_dim = config.kv_dim();

        let k = vec![1.0; kv_dim];
        let v = vec![2.0; kv_dim];
        store.write(1, 2, 3, &k, &v);

        let (keys, values) = store.layer_pools(1);
        let offset = (2 * 4 + 3) * kv_dim;
        assert_eq!(&keys[offset..offset + kv_dim], &k[..]);
        assert_eq!(&values[offset..offset + kv_dim], &v[..]);

        // Layer 0 untouched.
        let (keys0, _) = store.layer_pools(0);
        assert!(keys0.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn paged_reset_zeroes() {
        let config = tiny_config();
        let mut store = PagedKvStore::new(&config, &BlockConfig::default());
        store.write(0, 0, 0, &vec![1.0; config.kv_dim()], &vec![1.0; config.kv_dim()]);
        store.reset();
        let (keys, values) = store.layer_pools(0);
        assert!(keys.iter().all(|&x| x == 0.0));
        assert!(values.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn contiguous_write_lands_at_position() {
        let config = tiny_config();
        let mut store = ContiguousKvStore::new(&config);
        let kv_dim = config.kv_dim();

        let k = vec![3.0; kv_dim];
        let v = vec![4.0; kv_dim];
        store.write(1, 5, &k, &v);

        let (keys, values) = store.layer_caches(1);
        let offset = 5 * kv_dim;
        assert_eq!(&keys[offset..offset + kv_dim], &k[..]);
        assert_eq!(&values[offset..offset + kv_dim], &v[..]);
    }

    #[test]
    fn sequence_cache_per_layer_tables() {
        let mut seq = SequenceCache::new(9, 2);
        assert_eq!(seq.request_id(), 9);
        assert_eq!(seq.num_blocks(0), 0);

        seq.push_block(0, 7);
        seq.push_block(0, 3);
        seq.push_block(1, 5);
        assert_eq!(seq.blocks(0), &[7, 3]);
        assert_eq!(seq.blocks(1), &[5]);

        seq.clear();
        assert_eq!(seq.num_blocks(0), 0);
        assert_eq!(seq.num_blocks(1), 0);
    }
}
