//! Persistent conversation state and the sequence manager boundary.

use crate::Result;

/// Identifier of a sequence (a session).
pub type SequenceId = u64;

/// Residency of a sequence's cache blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceStatus {
    /// Not scheduled; blocks (if any) may be reclaimed.
    #[default]
    Cached,
    /// Blocks are pinned but the sequence is not running this iteration.
    Locked,
    /// Blocks are pinned and the sequence runs this iteration.
    Active,
}

/// Conversation state owned by a [`SequenceManager`].
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    pub id: SequenceId,
    pub status: SequenceStatus,
    /// Token history (prompt and generated tokens of earlier requests).
    pub tokens: Vec<u32>,
    /// Prompt of the request that started the sequence.
    pub prompt: Vec<u32>,
    /// Number of tokens whose keys/values are resident in cache blocks.
    pub cache_len: usize,
    /// Number of tokens fed to the model in the current iteration.
    pub input_length: usize,
    /// Cache block ids, in logical order.
    pub blocks: Vec<usize>,
    /// RNG state saved when the sequence was swapped out of a slot.
    pub random_state: Option<u64>,
    pub rope_theta: f32,
}

impl Sequence {
    #[must_use]
    pub fn new(id: SequenceId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

/// Owner of sequences and their cache blocks.
///
/// Block ids and pointers returned by a manager are only valid until the
/// next call into it.
pub trait SequenceManager: Send {
    fn lookup(&self, id: SequenceId) -> Option<&Sequence>;

    fn lookup_mut(&mut self, id: SequenceId) -> Option<&mut Sequence>;

    /// Create an empty sequence, replacing (and freeing) an existing one
    /// with the same id.
    ///
    /// # Errors
    /// Returns an error if the manager cannot hold another sequence.
    fn create(&mut self, id: SequenceId) -> Result<&mut Sequence>;

    /// Remove a sequence and free its blocks. Returns `false` if unknown.
    fn erase(&mut self, id: SequenceId) -> bool;

    /// Make sure the sequence owns enough blocks for `total_tokens` tokens
    /// and pin them. Returns `false` when the pool cannot satisfy the
    /// request; the sequence then keeps whatever it owned before.
    ///
    /// # Errors
    /// Returns an error if the sequence is unknown.
    fn reserve(&mut self, id: SequenceId, total_tokens: usize) -> Result<bool>;

    /// Unpin the sequence's blocks so later reservations may reclaim them.
    /// A sequence whose blocks are reclaimed drops back to `cache_len == 0`.
    ///
    /// # Errors
    /// Returns an error if the sequence is unknown.
    fn unlock(&mut self, id: SequenceId) -> Result<()>;

    /// Device addresses of the sequence's blocks, in logical order.
    ///
    /// # Errors
    /// Returns an error if the sequence is unknown.
    fn block_ptrs(&self, id: SequenceId) -> Result<Vec<u64>>;

    /// Tokens per cache block.
    fn block_size(&self) -> usize;

    /// Blocks not owned by any sequence.
    fn free_blocks(&self) -> usize;
}
