//! Generation requests and the events delivered back to their callers.

#![allow(clippy::module_name_repetitions)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use crate::sampling::GenerationConfig;
use crate::sequence::SequenceId;

/// Unique request id. Assigned in arrival order, so it doubles as the
/// FIFO priority used by admission control.
pub type RequestId = u64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// An end id or stop sequence was produced.
    Stop,
    /// Reached the maximum number of tokens or the session length.
    Length,
    /// Stopped by a cancel or kill request.
    Cancelled,
}

/// An event produced by the engine during generation.
///
/// Sent through a single sender so ordering is guaranteed:
/// zero or more streaming events (`Token`, `Logits`, `HiddenState`), then
/// exactly one terminal event (`Finished` or `Error`).
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A newly generated token (only for streaming requests).
    Token(u32),
    /// Post-penalty logits of a generated token, `vocab_size` entries.
    Logits(Vec<f32>),
    /// Last hidden state of a generated token.
    HiddenState(Vec<f32>),
    /// Generation ended; `output_ids` holds every generated token.
    Finished {
        reason: FinishReason,
        output_ids: Vec<u32>,
    },
    /// The request was rejected or failed.
    Error(RequestStatus),
}

impl GenerationEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Error(_))
    }
}

/// Trait for sending generation events from the engine to the caller.
///
/// Return `false` to signal that the receiver has been dropped.
pub trait TokenSender: Send + Sync {
    /// Send a generation event to the receiver.
    fn send(&self, event: GenerationEvent) -> bool;
}

impl TokenSender for mpsc::Sender<GenerationEvent> {
    fn send(&self, event: GenerationEvent) -> bool {
        mpsc::Sender::send(self, event).is_ok()
    }
}

impl TokenSender for Box<dyn TokenSender> {
    fn send(&self, event: GenerationEvent) -> bool {
        (**self).send(event)
    }
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Outcome code attached to a request or a batch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestStatus {
    #[default]
    Ok,
    /// The referenced sequence does not exist, or limits are exceeded.
    Invalid,
    /// The session appears more than once in the same pull.
    Conflict,
    /// The session is already generating.
    Busy,
    Inactive,
    /// The sequence manager or device failed for this slot.
    Fail,
    /// History plus input does not fit in the session length.
    TooLong,
    Finish,
    Cancel,
    /// `start_flag` together with a non-zero `step`.
    Inconsistency,
}

/// Coarse grouping of [`RequestStatus`] codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Cancelled,
    /// Rejected before admission; no slot was consumed.
    Validation,
    /// A per-slot failure surfaced at finish.
    Sequence,
}

impl RequestStatus {
    #[must_use]
    pub fn kind(self) -> StatusKind {
        match self {
            Self::Ok | Self::Finish => StatusKind::Success,
            Self::Cancel => StatusKind::Cancelled,
            Self::Invalid
            | Self::Conflict
            | Self::Busy
            | Self::TooLong
            | Self::Inconsistency => StatusKind::Validation,
            Self::Inactive | Self::Fail => StatusKind::Sequence,
        }
    }

    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared cancellation flag. The engine only looks at it between
/// iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Session addressing of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionParam {
    /// Sequence the request reads from and appends to.
    pub id: SequenceId,
    /// Truncate the sequence history to this many tokens before appending
    /// the input. Zero keeps the whole history.
    pub step: usize,
    /// Start a new sequence (replacing any existing one with the same id).
    pub start_flag: bool,
    /// Erase the sequence once this request completes.
    pub end_flag: bool,
    /// Terminate the session instead of generating.
    pub kill_flag: bool,
}

impl SessionParam {
    /// A one-shot session: created for this request and erased afterwards.
    #[must_use]
    pub fn oneshot(id: SequenceId) -> Self {
        Self {
            id,
            step: 0,
            start_flag: true,
            end_flag: true,
            kill_flag: false,
        }
    }

    /// A kill request for an existing session.
    #[must_use]
    pub fn kill(id: SequenceId) -> Self {
        Self {
            id,
            kill_flag: true,
            ..Self::default()
        }
    }
}

/// A generation (or kill) request shared between the gateway, the engine
/// and the signals that complete it.
pub struct Request {
    pub id: RequestId,
    pub session: SessionParam,
    pub input_ids: Vec<u32>,
    pub gen_cfg: GenerationConfig,
    /// Deliver each token as a `Token` event as soon as it is produced.
    pub stream_output: bool,
    cancel: CancelToken,
    sender: Box<dyn TokenSender>,
    completed: AtomicBool,
}

impl Request {
    #[must_use]
    pub fn new(
        id: RequestId,
        session: SessionParam,
        input_ids: Vec<u32>,
        gen_cfg: GenerationConfig,
        sender: impl TokenSender + 'static,
    ) -> Self {
        Self {
            id,
            session,
            input_ids,
            gen_cfg,
            stream_output: false,
            cancel: CancelToken::new(),
            sender: Box::new(sender),
            completed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_stream_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn is_kill(&self) -> bool {
        self.session.kill_flag
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Send a non-terminal event. Dropped once the request has completed.
    pub fn stream(&self, event: GenerationEvent) -> bool {
        debug_assert!(!event.is_terminal());
        !self.is_completed() && self.sender.send(event)
    }

    /// Send the terminal event. Only the first call has an effect.
    ///
    /// Returns `false` if the request had already completed.
    pub fn complete(&self, event: GenerationEvent) -> bool {
        debug_assert!(event.is_terminal());
        if self.completed.swap(true, Ordering::AcqRel) {
            tracing::warn!(request = self.id, "duplicate completion ignored");
            return false;
        }
        self.sender.send(event);
        true
    }

    /// Complete with the terminal event corresponding to `status`.
    pub fn complete_with_status(&self, status: RequestStatus, output_ids: Vec<u32>) -> bool {
        let event = match status {
            RequestStatus::Ok | RequestStatus::Finish => GenerationEvent::Finished {
                reason: FinishReason::Stop,
                output_ids,
            },
            RequestStatus::Cancel => GenerationEvent::Finished {
                reason: FinishReason::Cancelled,
                output_ids,
            },
            other => GenerationEvent::Error(other),
        };
        self.complete(event)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("input_len", &self.input_ids.len())
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}
