//! Shared fixtures for the engine tests: a deterministic model, a gateway
//! the test drives by hand, and an engine builder over the CPU backend.

#![allow(dead_code, clippy::cast_precision_loss, clippy::cast_possible_truncation)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use turbine::model::{
    CONTEXT_LENGTHS, CU_BLOCK_COUNTS, INPUT_IDS, INPUT_LENGTHS, LAST_HIDDEN_STATE, LOGITS,
    ROPE_THETA,
};
use turbine::{
    DType, EngineConfig, Gateway, GenerationConfig, GenerationEvent, ModelForward,
    PendingRequests, Request, Result, SequenceManager, SessionParam, Signal, TensorMap,
};
use turbine_cpu::{CpuBackend, CpuTensor, HostSampler};
use turbine_runtime::{BlockPoolConfig, BlockSequenceManager, Engine};

pub const VOCAB: usize = 64;
pub const HIDDEN: usize = 4;
/// Logit given to the predicted token; every other column is zero.
pub const PEAK: f32 = 10.0;

/// Inputs seen by one model forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCall {
    pub input_lengths: Vec<u32>,
    pub context_lengths: Vec<u32>,
}

pub type ForwardLog = Arc<Mutex<Vec<ForwardCall>>>;

/// Predicts `(last input token + 1) % VOCAB` for every row. The hidden
/// state row is filled with the last input token.
pub struct CountingModel {
    log: ForwardLog,
}

impl ModelForward<CpuBackend> for CountingModel {
    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn forward(
        &mut self,
        _backend: &CpuBackend,
        inputs: &TensorMap<'_, CpuTensor>,
        outputs: &mut TensorMap<'_, CpuTensor>,
    ) -> Result<()> {
        let ids = inputs.get(INPUT_IDS)?.as_slice::<u32>()?;
        let lengths = inputs.get(INPUT_LENGTHS)?.as_slice::<u32>()?.to_vec();
        let batch = lengths.len();
        let contexts = inputs
            .expect(CONTEXT_LENGTHS, DType::U32, &[batch])?
            .as_slice::<u32>()?
            .to_vec();
        inputs.expect(CU_BLOCK_COUNTS, DType::U32, &[batch + 1])?;
        inputs.expect(ROPE_THETA, DType::F32, &[batch])?;

        let mut last = Vec::with_capacity(batch);
        let mut end = 0;
        for &len in &lengths {
            end += len as usize;
            last.push(ids[end - 1]);
        }

        {
            let logits = outputs
                .expect_mut(LOGITS, DType::F32, &[batch, VOCAB])?
                .as_mut_slice::<f32>()?;
            logits.fill(0.0);
            for (row, &token) in last.iter().enumerate() {
                logits[row * VOCAB + (token as usize + 1) % VOCAB] = PEAK;
            }
        }
        if outputs.contains(LAST_HIDDEN_STATE) {
            let hidden = outputs
                .expect_mut(LAST_HIDDEN_STATE, DType::F32, &[batch, HIDDEN])?
                .as_mut_slice::<f32>()?;
            for (row, &token) in last.iter().enumerate() {
                hidden[row * HIDDEN..(row + 1) * HIDDEN].fill(token as f32);
            }
        }

        self.log.lock().unwrap().push(ForwardCall {
            input_lengths: lengths,
            context_lengths: contexts,
        });
        Ok(())
    }
}

#[derive(Default)]
struct GatewayState {
    infer: VecDeque<Arc<Request>>,
    kill: Vec<Arc<Request>>,
    abort: bool,
    hold: bool,
    held: Vec<(u64, Vec<Signal>)>,
    next_epoch: u64,
}

/// A gateway driven from the test thread. Signals run inline on delivery
/// unless held, in which case [`ManualGateway::flush`] runs them.
#[derive(Default)]
pub struct ManualGateway {
    state: Mutex<GatewayState>,
    delivered: AtomicU64,
    next_request_id: AtomicU64,
}

impl ManualGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submit(
        &self,
        session: SessionParam,
        input_ids: Vec<u32>,
        gen_cfg: GenerationConfig,
    ) -> Caller {
        self.submit_streaming(session, input_ids, gen_cfg, false)
    }

    pub fn submit_streaming(
        &self,
        session: SessionParam,
        input_ids: Vec<u32>,
        gen_cfg: GenerationConfig,
        stream_output: bool,
    ) -> Caller {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel();
        let request =
            Request::new(id, session, input_ids, gen_cfg, tx).with_stream_output(stream_output);
        let caller = Caller {
            cancel: request.cancel_token(),
            events: rx,
        };
        let request = Arc::new(request);
        let mut state = self.state.lock().unwrap();
        if request.is_kill() {
            state.kill.push(request);
        } else {
            state.infer.push_back(request);
        }
        caller
    }

    pub fn kill(&self, session: u64) -> Caller {
        self.submit(
            SessionParam::kill(session),
            Vec::new(),
            GenerationConfig::default(),
        )
    }

    /// Keep delivered signals until [`flush`](Self::flush).
    pub fn hold(&self) {
        self.state.lock().unwrap().hold = true;
    }

    /// Run every held signal and stop holding.
    pub fn flush(&self) {
        let held = {
            let mut state = self.state.lock().unwrap();
            state.hold = false;
            std::mem::take(&mut state.held)
        };
        for (epoch, signals) in held {
            signals.into_iter().for_each(|signal| signal());
            self.delivered.store(epoch, Ordering::Release);
        }
    }

    pub fn abort(&self) {
        self.state.lock().unwrap().abort = true;
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().infer.len()
    }
}

impl Gateway for ManualGateway {
    fn pull_pending(&self, max_infer: usize, _blocking: bool) -> PendingRequests {
        let mut state = self.state.lock().unwrap();
        let take = if state.abort {
            state.infer.len()
        } else {
            max_infer.min(state.infer.len())
        };
        PendingRequests {
            infer: state.infer.drain(..take).collect(),
            kill: std::mem::take(&mut state.kill),
            abort: state.abort,
        }
    }

    fn deliver(&self, signals: Vec<Signal>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        if state.hold {
            state.held.push((epoch, signals));
        } else {
            drop(state);
            signals.into_iter().for_each(|signal| signal());
            self.delivered.store(epoch, Ordering::Release);
        }
        epoch
    }

    fn delivered_epoch(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}

/// The caller's end of a submitted request.
pub struct Caller {
    pub cancel: turbine::CancelToken,
    pub events: mpsc::Receiver<GenerationEvent>,
}

impl Caller {
    /// Events received so far, without waiting.
    pub fn drain(&self) -> Vec<GenerationEvent> {
        self.events.try_iter().collect()
    }

    /// The single terminal event, asserting that exactly one arrived.
    pub fn terminal(&self) -> GenerationEvent {
        let terminal: Vec<GenerationEvent> =
            self.drain().into_iter().filter(GenerationEvent::is_terminal).collect();
        assert_eq!(terminal.len(), 1, "expected one terminal event, got {terminal:?}");
        terminal.into_iter().next().unwrap()
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_batch_size: 4,
        session_len: 64,
        max_forward_token_num: 64,
        max_context_token_num: 64,
        cache_block_seq_len: 4,
        ..EngineConfig::default()
    }
}

pub fn build_engine(
    config: EngineConfig,
    gateway: &Arc<ManualGateway>,
) -> (Engine<CpuBackend>, ForwardLog) {
    build_engine_with(config, Arc::clone(gateway) as Arc<dyn Gateway>)
}

pub fn build_engine_with(
    config: EngineConfig,
    gateway: Arc<dyn Gateway>,
) -> (Engine<CpuBackend>, ForwardLog) {
    let sequences = block_sequences(&config, 256);
    build_engine_with_sequences(config, gateway, Box::new(sequences))
}

/// A block manager with `num_blocks` blocks of the configured size.
pub fn block_sequences(config: &EngineConfig, num_blocks: usize) -> BlockSequenceManager {
    BlockSequenceManager::new(
        BlockPoolConfig::new(config.cache_block_seq_len, num_blocks),
        config.rope_theta,
    )
    .unwrap()
}

pub fn build_engine_with_sequences(
    config: EngineConfig,
    gateway: Arc<dyn Gateway>,
    sequences: Box<dyn SequenceManager>,
) -> (Engine<CpuBackend>, ForwardLog) {
    let log = ForwardLog::default();
    let model = CountingModel {
        log: Arc::clone(&log),
    };
    let engine = Engine::new(
        config,
        CpuBackend::new(),
        Box::new(model),
        Box::new(HostSampler::new()),
        sequences,
        gateway,
    )
    .unwrap();
    (engine, log)
}

/// Iterate until no slot holds a request and nothing is queued.
pub fn run_until_idle(engine: &mut Engine<CpuBackend>, gateway: &ManualGateway) {
    for _ in 0..1000 {
        assert!(engine.iterate().unwrap());
        if engine.occupied_slots() == 0 && gateway.queued() == 0 {
            return;
        }
    }
    panic!("engine did not go idle");
}

pub fn max_tokens(max_new_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens,
        ..GenerationConfig::default()
    }
}

pub fn finished(reason: turbine::FinishReason, output_ids: Vec<u32>) -> GenerationEvent {
    GenerationEvent::Finished { reason, output_ids }
}
