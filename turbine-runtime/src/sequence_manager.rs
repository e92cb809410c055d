//! Block-pool sequence manager.
//!
//! Sequences own fixed-size cache blocks drawn from a shared free stack.
//! Pinned (active or locked) sequences keep their blocks; unlocked
//! sequences keep them only until another reservation runs short, at which
//! point the least recently used ones are reclaimed and must prefill their
//! history again.
//!
//! This is host-side bookkeeping only; the block memory itself belongs to
//! the model's cache, which maps block ids to addresses through
//! [`BlockPoolConfig::base_ptr`] and [`BlockPoolConfig::block_bytes`].

#![allow(clippy::must_use_candidate)]

use std::collections::HashMap;

use turbine::sequence::{Sequence, SequenceId, SequenceManager, SequenceStatus};
use turbine::{Error, Result};

/// Geometry of the block pool.
#[derive(Debug, Clone, Copy)]
pub struct BlockPoolConfig {
    /// Number of tokens stored per block.
    pub block_size: usize,
    /// Total number of blocks in the pool.
    pub num_blocks: usize,
    /// Address of block 0.
    pub base_ptr: u64,
    /// Distance between consecutive blocks.
    pub block_bytes: u64,
}

impl BlockPoolConfig {
    #[must_use]
    pub fn new(block_size: usize, num_blocks: usize) -> Self {
        Self {
            block_size,
            num_blocks,
            base_ptr: 0,
            block_bytes: 1,
        }
    }
}

struct Entry {
    sequence: Sequence,
    last_used: u64,
}

/// [`SequenceManager`] over a fixed pool of cache blocks.
pub struct BlockSequenceManager {
    config: BlockPoolConfig,
    free_blocks: Vec<usize>,
    entries: HashMap<SequenceId, Entry>,
    rope_theta: f32,
    clock: u64,
}

impl BlockSequenceManager {
    /// Create a manager with every block free.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the pool geometry is empty.
    pub fn new(config: BlockPoolConfig, rope_theta: f32) -> Result<Self> {
        if config.block_size == 0 || config.num_blocks == 0 {
            return Err(Error::Config(format!(
                "block pool needs block_size and num_blocks > 0, got {config:?}"
            )));
        }
        Ok(Self {
            free_blocks: (0..config.num_blocks).rev().collect(),
            config,
            entries: HashMap::new(),
            rope_theta,
            clock: 0,
        })
    }

    /// Total number of blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.config.num_blocks
    }

    /// Number of sequences known to the manager.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.config.block_size)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn entry_mut(&mut self, id: SequenceId) -> Result<&mut Entry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| Error::Sequence(format!("unknown sequence {id}")))
    }

    fn release_blocks(&mut self, blocks: Vec<usize>) {
        self.free_blocks.extend(blocks);
    }

    /// Unpinned sequences other than `except`, least recently used first.
    fn reclaimable(&self, except: SequenceId) -> Vec<SequenceId> {
        let mut ids: Vec<(u64, SequenceId)> = self
            .entries
            .iter()
            .filter(|(&id, e)| {
                id != except
                    && e.sequence.status == SequenceStatus::Cached
                    && !e.sequence.blocks.is_empty()
            })
            .map(|(&id, e)| (e.last_used, id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

impl SequenceManager for BlockSequenceManager {
    fn lookup(&self, id: SequenceId) -> Option<&Sequence> {
        self.entries.get(&id).map(|e| &e.sequence)
    }

    fn lookup_mut(&mut self, id: SequenceId) -> Option<&mut Sequence> {
        self.entries.get_mut(&id).map(|e| &mut e.sequence)
    }

    fn create(&mut self, id: SequenceId) -> Result<&mut Sequence> {
        self.erase(id);
        let last_used = self.tick();
        let mut sequence = Sequence::new(id);
        sequence.rope_theta = self.rope_theta;
        let entry = self.entries.entry(id).or_insert(Entry {
            sequence,
            last_used,
        });
        Ok(&mut entry.sequence)
    }

    fn erase(&mut self, id: SequenceId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.release_blocks(entry.sequence.blocks);
                true
            }
            None => false,
        }
    }

    fn reserve(&mut self, id: SequenceId, total_tokens: usize) -> Result<bool> {
        let needed = self.blocks_needed(total_tokens);
        let owned = self.entry_mut(id)?.sequence.blocks.len();
        let missing = needed.saturating_sub(owned);

        if missing > self.free_blocks.len() {
            let victims = self.reclaimable(id);
            let reclaimable: usize = victims
                .iter()
                .filter_map(|v| self.entries.get(v))
                .map(|e| e.sequence.blocks.len())
                .sum();
            if missing > self.free_blocks.len() + reclaimable {
                return Ok(false);
            }
            for victim in victims {
                if missing <= self.free_blocks.len() {
                    break;
                }
                if let Some(entry) = self.entries.get_mut(&victim) {
                    let blocks = std::mem::take(&mut entry.sequence.blocks);
                    entry.sequence.cache_len = 0;
                    tracing::debug!(
                        sequence = victim,
                        blocks = blocks.len(),
                        "reclaimed cache blocks"
                    );
                    self.release_blocks(blocks);
                }
            }
        }

        let new_blocks: Vec<usize> = (0..missing).filter_map(|_| self.free_blocks.pop()).collect();
        let last_used = self.tick();
        let entry = self.entry_mut(id)?;
        entry.sequence.blocks.extend(new_blocks);
        entry.sequence.status = SequenceStatus::Active;
        entry.last_used = last_used;
        Ok(true)
    }

    fn unlock(&mut self, id: SequenceId) -> Result<()> {
        let last_used = self.tick();
        let entry = self.entry_mut(id)?;
        entry.sequence.status = SequenceStatus::Cached;
        entry.last_used = last_used;
        Ok(())
    }

    fn block_ptrs(&self, id: SequenceId) -> Result<Vec<u64>> {
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| Error::Sequence(format!("unknown sequence {id}")))?;
        Ok(entry
            .sequence
            .blocks
            .iter()
            .map(|&b| self.config.base_ptr + b as u64 * self.config.block_bytes)
            .collect())
    }

    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn free_blocks(&self) -> usize {
        self.free_blocks.len()
    }
}
