//! The batch engine.
//!
//! [`Engine`] owns the triple-buffered batch state and every working device
//! buffer. Each call to [`Engine::iterate`] runs one scheduling iteration:
//!
//! ```text
//! pull ─► validate ─► kill ─► admit ─► cancel ─► deliver
//!      ─► initialize ─► forward ─► finish ─► deliver
//! ```
//!
//! [`Engine::start`] moves the engine onto a dedicated thread that calls
//! `iterate` until the gateway reports an abort. Completion callbacks never
//! run on that thread: they are handed to the gateway's output stage as
//! [`Signal`]s, and a slot whose request was released in some delivery epoch
//! is not reused until that epoch has been invoked.

#![allow(clippy::module_name_repetitions)]

mod requests;
mod step;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use turbine::model::{
    ModelForward, BLOCK_PTRS, CONTEXT_LENGTHS, CU_BLOCK_COUNTS, INPUT_IDS, INPUT_LENGTHS, LOGITS,
    ROPE_THETA,
};
use turbine::signal::status_signal;
use turbine::{
    DType, DynamicDecode, EngineConfig, Error, Gateway, GenerationEvent, RequestStatus, Result,
    SequenceManager, Signal, TensorMap,
};

use crate::batch_state::{Roles, TripleBuffer};
use crate::generation::GenerationState;
use crate::release::ReleaseLedger;
use crate::EngineBackend;

use step::SamplingBuffers;

/// Staging buffers shared with other tensor-parallel ranks.
struct CommBuffers<B: EngineBackend> {
    /// u32 `[max_batch_size]`: ids sampled this iteration.
    sampled_ids: B::Tensor,
}

/// Host copy of the cache block table built by `initialize`.
#[derive(Debug, Default)]
struct BlockTable {
    cu_block_counts: Vec<u32>,
    block_ptrs: Vec<u64>,
}

/// Continuous-batching engine over backend `B`.
pub struct Engine<B: EngineBackend> {
    config: EngineConfig,
    backend: B,
    model: Box<dyn ModelForward<B>>,
    decode: Box<dyn DynamicDecode<B>>,
    sequences: Box<dyn SequenceManager>,
    gateway: Arc<dyn Gateway>,

    buffers: TripleBuffer<B>,
    generation: GenerationState,
    releases: ReleaseLedger,
    /// Slots cleared since the last delivery.
    released: usize,

    /// u32 `[session_len, max_batch_size]`: step-major token history.
    history: B::Tensor,
    sampling: Option<SamplingBuffers<B>>,
    blocks: BlockTable,
    comm: Option<CommBuffers<B>>,
    /// Streaming events captured during `forward`, emitted by `finish`.
    captured: Vec<(usize, GenerationEvent)>,
}

impl<B: EngineBackend> Engine<B> {
    /// Build an engine and allocate its buffers.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for an invalid configuration or a model
    /// whose logits cannot be penalized, and any allocation error.
    pub fn new(
        config: EngineConfig,
        backend: B,
        model: Box<dyn ModelForward<B>>,
        decode: Box<dyn DynamicDecode<B>>,
        sequences: Box<dyn SequenceManager>,
        gateway: Arc<dyn Gateway>,
    ) -> Result<Self> {
        config.validate()?;
        if model.padded_vocab_size() < model.vocab_size() || model.vocab_size() == 0 {
            return Err(Error::Config(format!(
                "padded vocab {} smaller than vocab {}",
                model.padded_vocab_size(),
                model.vocab_size()
            )));
        }
        if !model.logits_dtype().is_float() {
            return Err(Error::Config(format!(
                "model produces {} logits",
                model.logits_dtype()
            )));
        }

        let buffers = TripleBuffer::new(&backend, config.max_batch_size, config.session_len)?;
        let history = backend.zeros(&[config.session_len, config.max_batch_size], DType::U32)?;
        let mut engine = Self {
            generation: GenerationState::new(config.max_prefill_iters),
            buffers,
            history,
            backend,
            model,
            decode,
            sequences,
            gateway,
            releases: ReleaseLedger::new(),
            released: 0,
            sampling: None,
            blocks: BlockTable::default(),
            comm: None,
            captured: Vec::new(),
            config,
        };
        engine.alloc_comm_buffers()?;
        if engine.config.enable_warmup {
            engine.warmup()?;
        }
        tracing::info!(
            max_batch_size = engine.config.max_batch_size,
            session_len = engine.config.session_len,
            tp_rank = engine.config.tp_rank,
            "engine created"
        );
        Ok(engine)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Sequence manager owned by the engine.
    #[must_use]
    pub fn sequences(&self) -> &dyn SequenceManager {
        self.sequences.as_ref()
    }

    /// Number of slots holding a request, in the active and incoming
    /// buffers.
    #[must_use]
    pub fn occupied_slots(&self) -> usize {
        self.buffers.active().occupied().count() + self.buffers.incoming().occupied().count()
    }

    /// Slots released but not yet delivered by the output stage.
    pub fn outstanding_slots(&mut self) -> usize {
        self.releases.outstanding(self.gateway.delivered_epoch())
    }

    fn is_root(&self) -> bool {
        self.config.tp_rank == 0
    }

    /// Run one scheduling iteration.
    ///
    /// Returns `Ok(false)` once the gateway has asked the engine to stop;
    /// every in-flight request has then been cancelled.
    ///
    /// # Errors
    /// Returns the first backend, model or sequence-manager error. The
    /// batch is left as it was at the failure; callers should stop.
    pub fn iterate(&mut self) -> Result<bool> {
        let outstanding = self.outstanding_slots();
        let occupied = self.buffers.active().size + self.buffers.incoming().size;
        let max_infer = self
            .config
            .max_batch_size
            .saturating_sub(occupied + outstanding);
        let blocking = occupied == 0 && outstanding == 0;

        let pending = self.gateway.pull_pending(max_infer, blocking);
        if pending.abort {
            let mut signals: Vec<Signal> = pending
                .infer
                .into_iter()
                .chain(pending.kill)
                .map(|r| status_signal(r, RequestStatus::Cancel))
                .collect();
            self.abort(&mut signals);
            return Ok(false);
        }
        if occupied == 0 && pending.is_empty() {
            if outstanding > 0 {
                thread::yield_now();
            }
            return Ok(true);
        }

        let mut signals = Vec::new();
        let (infer, kill) = self.disable_invalid_requests(pending.infer, pending.kill, &mut signals);
        self.process_kill_requests(&kill, &mut signals)?;
        self.process_infer_requests(infer, &mut signals)?;
        let cancelled = self.find_canceled_indices();
        self.process_cancel_requests(&cancelled, &mut signals)?;
        self.deliver(signals);

        if self.buffers.active().size + self.buffers.incoming().size == 0 {
            return Ok(true);
        }

        let mut signals = Vec::new();
        self.initialize(&mut signals)?;
        if self.buffers.active().active_size == 0 {
            self.deliver(signals);
            thread::yield_now();
            return Ok(true);
        }
        self.forward()?;
        self.finish(&mut signals)?;
        self.deliver(signals);
        Ok(true)
    }

    /// Move the engine onto its own thread.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn start(self) -> Result<EngineHandle> {
        let thread = thread::Builder::new()
            .name(format!("turbine-engine-{}", self.config.tp_rank))
            .spawn(move || self.internal_thread_entry())?;
        Ok(EngineHandle {
            thread: Some(thread),
        })
    }

    fn internal_thread_entry(mut self) {
        tracing::info!(tp_rank = self.config.tp_rank, "engine loop started");
        loop {
            match self.iterate() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!("engine loop stopped by gateway");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "engine iteration failed, stopping");
                    self.drain(RequestStatus::Fail);
                    break;
                }
            }
        }
    }

    /// Hand `signals` to the gateway and account for the slots released
    /// since the previous delivery.
    fn deliver(&mut self, signals: Vec<Signal>) {
        let released = std::mem::take(&mut self.released);
        if signals.is_empty() || !self.is_root() {
            return;
        }
        let epoch = self.gateway.deliver(signals);
        self.releases.record(epoch, released);
    }

    fn abort(&mut self, signals: &mut Vec<Signal>) {
        let in_flight = self.occupied_slots();
        tracing::info!(in_flight, "aborting engine");
        signals.extend(self.take_requests(RequestStatus::Cancel));
        self.deliver(std::mem::take(signals));
    }

    /// Complete every request still held by a slot with `status`.
    fn drain(&mut self, status: RequestStatus) {
        let signals = self.take_requests(status);
        self.deliver(signals);
    }

    fn take_requests(&mut self, status: RequestStatus) -> Vec<Signal> {
        let Roles {
            active, incoming, ..
        } = self.buffers.roles();
        let mut signals = Vec::new();
        for state in [active, incoming] {
            for slot in 0..state.size {
                if let Some(request) = state.requests[slot].take() {
                    signals.push(status_signal(request, status));
                }
            }
            state.clear();
        }
        self.released += signals.len();
        signals
    }

    /// Run one throwaway forward pass for every power-of-two batch size up
    /// to `max_batch_size`.
    fn warmup(&mut self) -> Result<()> {
        let sizes = std::iter::successors(Some(1usize), |&bs| bs.checked_mul(2))
            .take_while(|&bs| bs <= self.config.max_batch_size);
        for bs in sizes {
            let input_ids = self.backend.from_slice(&[bs], &vec![0u32; bs])?;
            let input_lengths = self.backend.from_slice(&[bs], &vec![1u32; bs])?;
            let context_lengths = self.backend.from_slice(&[bs], &vec![1u32; bs])?;
            let cu_block_counts = self.backend.zeros(&[bs + 1], DType::U32)?;
            let block_ptrs = self.backend.zeros(&[0], DType::U64)?;
            let rope_theta = self
                .backend
                .from_slice(&[bs], &vec![self.config.rope_theta; bs])?;
            let mut logits = self.backend.zeros(
                &[bs, self.model.padded_vocab_size()],
                self.model.logits_dtype(),
            )?;

            let mut inputs = TensorMap::new();
            inputs
                .insert(INPUT_IDS, &input_ids)
                .insert(INPUT_LENGTHS, &input_lengths)
                .insert(CONTEXT_LENGTHS, &context_lengths)
                .insert(CU_BLOCK_COUNTS, &cu_block_counts)
                .insert(BLOCK_PTRS, &block_ptrs)
                .insert(ROPE_THETA, &rope_theta);
            let mut outputs = TensorMap::new();
            outputs.insert_mut(LOGITS, &mut logits);
            self.model.forward(&self.backend, &inputs, &mut outputs)?;
            tracing::debug!(batch_size = bs, "warmup forward done");
        }
        self.backend.synchronize()
    }

    fn alloc_comm_buffers(&mut self) -> Result<()> {
        let register = self.config.tp_size > 1;
        let sampled_ids =
            self.backend
                .alloc_comm_buffer(&[self.config.max_batch_size], DType::U32, register)?;
        self.comm = Some(CommBuffers { sampled_ids });
        Ok(())
    }

    fn free_comm_buffers(&mut self) {
        if let Some(comm) = self.comm.take() {
            self.backend.free_comm_buffer(comm.sampled_ids);
        }
    }
}

impl<B: EngineBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.drain(RequestStatus::Cancel);
        self.free_comm_buffers();
    }
}

/// Handle to an engine running on its own thread.
pub struct EngineHandle {
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Wait for the engine thread to exit.
    ///
    /// # Errors
    /// Returns [`Error::Other`] if the engine thread panicked.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::Other("engine thread panicked".into())),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}
