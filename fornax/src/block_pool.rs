//! Physical block pool for the paged KV cache.
//!
//! Tracks which of the `num_blocks` fixed-size KV blocks are free and which
//! request owns each allocated block. Requests allocate blocks one at a time
//! as their sequences cross block boundaries and release everything in one
//! bulk operation when they terminate.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::BlockConfig;
use crate::{Error, Result};

struct PoolState {
    /// `free[i]` is true iff physical block `i` is unallocated.
    free: Vec<bool>,
    num_free: usize,
    /// Blocks owned by each live request, in allocation order.
    owners: HashMap<u64, Vec<usize>>,
}

/// Mutex-protected pool of physical KV cache blocks.
///
/// All operations, including read-only inspectors, take the pool lock so
/// callers observe a consistent snapshot. Allocation is lowest-index-first,
/// which keeps runs reproducible.
pub struct BlockPool {
    state: Mutex<PoolState>,
    num_blocks: usize,
    block_size: usize,
}

impl BlockPool {
    /// Create a pool with all blocks free.
    ///
    /// # Panics
    /// Panics if `block_size` or `num_blocks` is zero.
    #[must_use]
    pub fn new(config: &BlockConfig) -> Self {
        assert!(config.block_size > 0, "block_size must be > 0");
        assert!(config.num_blocks > 0, "num_blocks must be > 0");

        info!(
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            "block pool initialized"
        );
        Self {
            state: Mutex::new(PoolState {
                free: vec![true; config.num_blocks],
                num_free: config.num_blocks,
                owners: HashMap::new(),
            }),
            num_blocks: config.num_blocks,
            block_size: config.block_size,
        }
    }

    /// Allocate the lowest-indexed free block and record it against
    /// `request_id`.
    ///
    /// # Errors
    /// Returns [`Error::NoFreeBlocks`] if the pool is exhausted.
    pub fn allocate_one(&self, request_id: u64) -> Result<usize> {
        let mut state = self.lock();
        let block_id = Self::claim_lowest(&mut state).ok_or(Error::NoFreeBlocks)?;
        state.owners.entry(request_id).or_default().push(block_id);
        Ok(block_id)
    }

    /// Allocate enough blocks to hold `num_tokens` tokens
    /// (`ceil(num_tokens / block_size)`), atomically.
    ///
    /// Either all blocks are allocated and recorded against `request_id`, or
    /// none are.
    ///
    /// # Errors
    /// Returns [`Error::NoFreeBlocks`] if fewer than the required number of
    /// blocks are free; the pool is left unchanged.
    pub fn allocate_many(&self, request_id: u64, num_tokens: usize) -> Result<Vec<usize>> {
        let needed = num_tokens.div_ceil(self.block_size);
        let mut state = self.lock();

        if state.num_free < needed {
            return Err(Error::NoFreeBlocks);
        }

        let mut allocated = Vec::with_capacity(needed);
        for _ in 0..needed {
            match Self::claim_lowest(&mut state) {
                Some(block_id) => allocated.push(block_id),
                None => {
                    // Roll back everything claimed so far.
                    for &block_id in &allocated {
                        state.free[block_id] = true;
                        state.num_free += 1;
                    }
                    return Err(Error::NoFreeBlocks);
                }
            }
        }

        state
            .owners
            .entry(request_id)
            .or_default()
            .extend_from_slice(&allocated);
        Ok(allocated)
    }

    /// Release every block owned by `request_id`. No-op for unknown ids.
    pub fn free_request(&self, request_id: u64) {
        let mut state = self.lock();
        let Some(blocks) = state.owners.remove(&request_id) else {
            return;
        };
        for block_id in blocks {
            Self::release(&mut state, block_id);
        }
        info!(request_id, "freed all blocks for request");
    }

    /// Release a single block.
    ///
    /// Freeing an already-free block logs a warning and is otherwise a no-op.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBlockId`] if `block_id` is out of range.
    pub fn free_one(&self, block_id: usize) -> Result<()> {
        if block_id >= self.num_blocks {
            return Err(Error::InvalidBlockId(block_id));
        }
        let mut state = self.lock();
        if state.free[block_id] {
            warn!(block_id, "block is already free");
            return Ok(());
        }
        Self::release(&mut state, block_id);
        // Keep the owner map consistent if the block was request-owned.
        for blocks in state.owners.values_mut() {
            blocks.retain(|&b| b != block_id);
        }
        state.owners.retain(|_, blocks| !blocks.is_empty());
        Ok(())
    }

    /// Return every block to the pool and clear all ownership records.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.free.fill(true);
        state.num_free = self.num_blocks;
        state.owners.clear();
    }

    /// Number of free blocks remaining.
    #[must_use]
    pub fn num_free(&self) -> usize {
        self.lock().num_free
    }

    /// Total number of blocks in the pool.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Number of tokens per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Fraction of the pool currently allocated, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f32 {
        1.0 - self.lock().num_free as f32 / self.num_blocks as f32
    }

    /// Number of requests that currently own at least one block.
    #[must_use]
    pub fn num_active_requests(&self) -> usize {
        self.lock().owners.len()
    }

    /// Number of blocks owned by `request_id` (0 for unknown ids).
    #[must_use]
    pub fn request_block_count(&self, request_id: u64) -> usize {
        self.lock()
            .owners
            .get(&request_id)
            .map_or(0, Vec::len)
    }

    /// Number of blocks needed to store `num_tokens` tokens.
    #[must_use]
    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    fn claim_lowest(state: &mut PoolState) -> Option<usize> {
        let block_id = state.free.iter().position(|&f| f)?;
        state.free[block_id] = false;
        state.num_free -= 1;
        Some(block_id)
    }

    fn release(state: &mut PoolState, block_id: usize) {
        debug_assert!(!state.free[block_id]);
        state.free[block_id] = true;
        state.num_free += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Pool state cannot be left inconsistent mid-operation, so a
        // poisoned lock only means a panicking test thread; recover.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
