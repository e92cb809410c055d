//! Deferred completion callbacks.
//!
//! The engine never talks to a request's sender directly. It captures what
//! the caller must receive into a [`Signal`] and hands the signal to the
//! gateway, whose output stage invokes it once the device work it depends
//! on has completed.

use std::sync::Arc;

use crate::request::{GenerationEvent, Request, RequestStatus};

/// A zero-argument callback invoked exactly once on the output stage.
pub type Signal = Box<dyn FnOnce() + Send + 'static>;

/// Signal that sends a non-terminal event.
#[must_use]
pub fn stream_signal(request: Arc<Request>, event: GenerationEvent) -> Signal {
    Box::new(move || {
        request.stream(event);
    })
}

/// Signal that sends the terminal event.
#[must_use]
pub fn complete_signal(request: Arc<Request>, event: GenerationEvent) -> Signal {
    Box::new(move || {
        request.complete(event);
    })
}

/// Signal that completes `request` with `status` and no output.
#[must_use]
pub fn status_signal(request: Arc<Request>, status: RequestStatus) -> Signal {
    Box::new(move || {
        request.complete_with_status(status, Vec::new());
    })
}
