//! In-process gateway over `std::sync::mpsc`.
//!
//! Callers submit requests from any thread; the engine pulls them through
//! the [`Gateway`] trait. Signals delivered by the engine travel over a
//! channel to an output thread owned by the gateway, which invokes them in
//! order and then publishes the batch's epoch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use turbine::{
    CancelToken, GenerationConfig, GenerationEvent, Gateway, PendingRequests, Request, RequestId,
    RequestStatus, SessionParam, Signal,
};

/// One delivery: the signals of an engine step and the epoch they complete.
struct SignalBatch {
    epoch: u64,
    signals: Vec<Signal>,
}

#[derive(Default)]
struct Queue {
    infer: VecDeque<Arc<Request>>,
    kill: Vec<Arc<Request>>,
    shutdown: bool,
}

struct Output {
    tx: Option<mpsc::Sender<SignalBatch>>,
    next_epoch: u64,
}

/// A submitted request as seen by its caller.
pub struct Submission {
    pub id: RequestId,
    pub cancel: CancelToken,
    pub events: mpsc::Receiver<GenerationEvent>,
}

impl Submission {
    /// Block until the terminal event and return every event received.
    #[must_use]
    pub fn wait(self) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        for event in self.events {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

/// [`Gateway`] backed by an in-memory queue and an output thread.
pub struct ChannelGateway {
    queue: Mutex<Queue>,
    ready: Condvar,
    next_request_id: AtomicU64,
    output: Mutex<Output>,
    delivered: Arc<AtomicU64>,
    output_thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelGateway {
    /// Create the gateway and start its output thread.
    ///
    /// # Errors
    /// Returns an error if the output thread cannot be spawned.
    pub fn new() -> turbine::Result<Self> {
        let (tx, rx) = mpsc::channel::<SignalBatch>();
        let delivered = Arc::new(AtomicU64::new(0));
        let published = Arc::clone(&delivered);
        let output_thread = thread::Builder::new()
            .name("turbine-output".into())
            .spawn(move || {
                for batch in rx {
                    for signal in batch.signals {
                        signal();
                    }
                    published.store(batch.epoch, Ordering::Release);
                }
            })?;
        Ok(Self {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
            next_request_id: AtomicU64::new(1),
            output: Mutex::new(Output {
                tx: Some(tx),
                next_epoch: 1,
            }),
            delivered,
            output_thread: Mutex::new(Some(output_thread)),
        })
    }

    fn enqueue(&self, request: Arc<Request>) {
        let mut queue = lock(&self.queue);
        if queue.shutdown {
            drop(queue);
            request.complete_with_status(RequestStatus::Cancel, Vec::new());
            return;
        }
        if request.is_kill() {
            queue.kill.push(request);
        } else {
            queue.infer.push_back(request);
        }
        self.ready.notify_all();
    }

    /// Queue a generation request.
    pub fn submit(
        &self,
        session: SessionParam,
        input_ids: Vec<u32>,
        gen_cfg: GenerationConfig,
        stream_output: bool,
    ) -> Submission {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::channel();
        let request = Request::new(id, session, input_ids, gen_cfg, tx)
            .with_stream_output(stream_output);
        let cancel = request.cancel_token();
        self.enqueue(Arc::new(request));
        Submission { id, cancel, events }
    }

    /// Queue a kill request for `session`.
    pub fn kill(&self, session: u64) -> Submission {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::channel();
        let request = Request::new(
            id,
            SessionParam::kill(session),
            Vec::new(),
            GenerationConfig::default(),
            tx,
        );
        let cancel = request.cancel_token();
        self.enqueue(Arc::new(request));
        Submission { id, cancel, events }
    }

    /// Ask the engine to stop. Requests still queued are cancelled.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Request>> = {
            let mut guard = lock(&self.queue);
            let queue = &mut *guard;
            queue.shutdown = true;
            self.ready.notify_all();
            queue.infer.drain(..).chain(queue.kill.drain(..)).collect()
        };
        for request in drained {
            request.complete_with_status(RequestStatus::Cancel, Vec::new());
        }
    }

    /// Number of generation requests waiting to be pulled.
    #[must_use]
    pub fn queued(&self) -> usize {
        lock(&self.queue).infer.len()
    }
}

impl Gateway for ChannelGateway {
    fn pull_pending(&self, max_infer: usize, blocking: bool) -> PendingRequests {
        let mut queue = lock(&self.queue);
        if blocking {
            queue = self
                .ready
                .wait_while(queue, |q| {
                    !q.shutdown && q.infer.is_empty() && q.kill.is_empty()
                })
                .unwrap_or_else(PoisonError::into_inner);
        }
        if queue.shutdown {
            return PendingRequests {
                abort: true,
                ..PendingRequests::default()
            };
        }
        let take = max_infer.min(queue.infer.len());
        PendingRequests {
            infer: queue.infer.drain(..take).collect(),
            kill: std::mem::take(&mut queue.kill),
            abort: false,
        }
    }

    fn deliver(&self, signals: Vec<Signal>) -> u64 {
        let mut output = lock(&self.output);
        let epoch = output.next_epoch;
        output.next_epoch += 1;
        let batch = SignalBatch { epoch, signals };
        match output.tx.as_ref() {
            Some(tx) => {
                if let Err(mpsc::SendError(batch)) = tx.send(batch) {
                    tracing::warn!(epoch, "output thread gone, running signals inline");
                    batch.signals.into_iter().for_each(|signal| signal());
                    self.delivered.store(epoch, Ordering::Release);
                }
            }
            None => {
                batch.signals.into_iter().for_each(|signal| signal());
                self.delivered.store(epoch, Ordering::Release);
            }
        }
        epoch
    }

    fn delivered_epoch(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}

impl Drop for ChannelGateway {
    fn drop(&mut self) {
        lock(&self.output).tx = None;
        if let Some(thread) = lock(&self.output_thread).take() {
            if thread.join().is_err() {
                tracing::error!("output thread panicked");
            }
        }
    }
}
