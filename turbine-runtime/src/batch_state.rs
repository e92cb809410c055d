//! Per-slot batch state and the triple buffer that holds three of them.
//!
//! Every per-slot field is a parallel array indexed by slot. Slots
//! `[0, active_size)` run this iteration, `[active_size, size)` hold
//! sequences waiting for budget, and the rest are free. A slot whose
//! request was interrupted stays inside `[0, size)` as a hole until the
//! next compaction.

use std::sync::Arc;

use turbine::backend::{Backend, CopyPair, IndexedCopyOps};
use turbine::dtype::DType;
use turbine::request::{Request, RequestStatus};
use turbine::sequence::SequenceId;
use turbine::Result;

pub struct BatchState<B: Backend> {
    pub size: usize,
    pub active_size: usize,
    pub prompt_length: Vec<usize>,
    /// Tokens in the slot's `output_ids` row.
    pub context_length: Vec<usize>,
    pub finished: Vec<bool>,
    pub rope_theta: Vec<f32>,
    /// Generation stops once `context_length` reaches this value.
    pub seq_len_limit: Vec<usize>,
    pub errors: Vec<RequestStatus>,
    /// The slot received a truncated prefill in an earlier iteration.
    pub mid_prefill: Vec<bool>,
    pub sequences: Vec<Option<SequenceId>>,
    pub requests: Vec<Option<Arc<Request>>>,
    /// u32 `[max_batch_size, session_len]`: history, input and generated
    /// tokens of each slot.
    pub output_ids: B::Tensor,
    /// u64 `[max_batch_size]`: sampler state of each slot.
    pub rng_state: B::Tensor,
}

impl<B: Backend> BatchState<B> {
    /// Allocate host arrays and device buffers for `max_batch_size` slots.
    ///
    /// # Errors
    /// Returns an error if the device buffers cannot be allocated.
    pub fn new(backend: &B, max_batch_size: usize, session_len: usize) -> Result<Self> {
        Ok(Self {
            size: 0,
            active_size: 0,
            prompt_length: vec![0; max_batch_size],
            context_length: vec![0; max_batch_size],
            finished: vec![false; max_batch_size],
            rope_theta: vec![0.0; max_batch_size],
            seq_len_limit: vec![0; max_batch_size],
            errors: vec![RequestStatus::Ok; max_batch_size],
            mid_prefill: vec![false; max_batch_size],
            sequences: vec![None; max_batch_size],
            requests: vec![None; max_batch_size],
            output_ids: backend.zeros(&[max_batch_size, session_len], DType::U32)?,
            rng_state: backend.zeros(&[max_batch_size], DType::U64)?,
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_occupied(&self, slot: usize) -> bool {
        self.requests[slot].is_some()
    }

    /// Occupied slots in `[0, size)`.
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(|&i| self.is_occupied(i))
    }

    /// Slot holding `session`, if any.
    #[must_use]
    pub fn find_session(&self, session: SequenceId) -> Option<usize> {
        (0..self.size).find(|&i| self.sequences[i] == Some(session) && self.is_occupied(i))
    }

    /// Reset the host fields of one slot. Device rows are left as-is and
    /// overwritten on the next use.
    pub fn clear_slot(&mut self, slot: usize) {
        self.prompt_length[slot] = 0;
        self.context_length[slot] = 0;
        self.finished[slot] = false;
        self.rope_theta[slot] = 0.0;
        self.seq_len_limit[slot] = 0;
        self.errors[slot] = RequestStatus::Ok;
        self.mid_prefill[slot] = false;
        self.sequences[slot] = None;
        self.requests[slot] = None;
    }

    /// Empty every slot.
    pub fn clear(&mut self) {
        for slot in 0..self.size {
            self.clear_slot(slot);
        }
        self.size = 0;
        self.active_size = 0;
    }

    fn copy_host_slot(&mut self, dst: usize, src: &Self, from: usize) {
        self.prompt_length[dst] = src.prompt_length[from];
        self.context_length[dst] = src.context_length[from];
        self.finished[dst] = src.finished[from];
        self.rope_theta[dst] = src.rope_theta[from];
        self.seq_len_limit[dst] = src.seq_len_limit[from];
        self.errors[dst] = src.errors[from];
        self.mid_prefill[dst] = src.mid_prefill[from];
        self.sequences[dst] = src.sequences[from];
        self.requests[dst].clone_from(&src.requests[from]);
    }
}

/// Which buffer a slot is copied from during compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Active,
    Incoming,
}

/// One slot moved by [`copy_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMove {
    pub source: Source,
    pub src: usize,
    pub dst: usize,
}

/// Mutable handles to the three buffers, tagged by their current role.
pub struct Roles<'a, B: Backend> {
    pub active: &'a mut BatchState<B>,
    pub back: &'a mut BatchState<B>,
    pub incoming: &'a mut BatchState<B>,
}

/// Three interchangeable batch states.
///
/// `active` is the batch being run, `incoming` receives newly admitted
/// requests, and `back` is the compaction target. After a compaction the
/// roles of `active` and `back` are swapped; no data moves.
pub struct TripleBuffer<B: Backend> {
    active: BatchState<B>,
    back: BatchState<B>,
    incoming: BatchState<B>,
}

impl<B: Backend> TripleBuffer<B> {
    /// # Errors
    /// Returns an error if any buffer cannot be allocated.
    pub fn new(backend: &B, max_batch_size: usize, session_len: usize) -> Result<Self> {
        Ok(Self {
            active: BatchState::new(backend, max_batch_size, session_len)?,
            back: BatchState::new(backend, max_batch_size, session_len)?,
            incoming: BatchState::new(backend, max_batch_size, session_len)?,
        })
    }

    #[must_use]
    pub fn active(&self) -> &BatchState<B> {
        &self.active
    }

    pub fn active_mut(&mut self) -> &mut BatchState<B> {
        &mut self.active
    }

    #[must_use]
    pub fn incoming(&self) -> &BatchState<B> {
        &self.incoming
    }

    pub fn incoming_mut(&mut self) -> &mut BatchState<B> {
        &mut self.incoming
    }

    pub fn roles(&mut self) -> Roles<'_, B> {
        Roles {
            active: &mut self.active,
            back: &mut self.back,
            incoming: &mut self.incoming,
        }
    }

    /// Make the compacted `back` buffer the active one.
    pub fn swap_active_back(&mut self) {
        std::mem::swap(&mut self.active, &mut self.back);
    }
}

/// Copy slots from `active` and `incoming` into `back`.
///
/// Host fields are copied per slot; the device rows of each source buffer
/// move with a single indexed copy covering every device buffer.
///
/// # Errors
/// Returns an error if the device copy fails.
pub fn copy_state<B: IndexedCopyOps>(
    backend: &B,
    buffers: &mut TripleBuffer<B>,
    moves: &[SlotMove],
) -> Result<()> {
    let Roles {
        active,
        back,
        incoming,
    } = buffers.roles();

    for (source, state) in [(Source::Active, &*active), (Source::Incoming, &*incoming)] {
        let (src_idx, dst_idx): (Vec<usize>, Vec<usize>) = moves
            .iter()
            .filter(|m| m.source == source)
            .map(|m| (m.src, m.dst))
            .unzip();
        if src_idx.is_empty() {
            continue;
        }
        for (&src, &dst) in src_idx.iter().zip(&dst_idx) {
            back.copy_host_slot(dst, state, src);
        }
        backend.indexed_copy(
            &src_idx,
            &dst_idx,
            src_idx.len(),
            &mut [
                CopyPair {
                    src: &state.output_ids,
                    dst: &mut back.output_ids,
                },
                CopyPair {
                    src: &state.rng_state,
                    dst: &mut back.rng_state,
                },
            ],
        )?;
    }
    Ok(())
}
