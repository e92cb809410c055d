//! Request ingress/egress boundary.

use std::sync::Arc;

use crate::request::Request;
use crate::signal::Signal;

/// Requests handed to the engine by one [`Gateway::pull_pending`] call.
#[derive(Debug, Default)]
pub struct PendingRequests {
    /// Generation requests in arrival order.
    pub infer: Vec<Arc<Request>>,
    /// Requests with `session.kill_flag` set.
    pub kill: Vec<Arc<Request>>,
    /// The gateway is shutting down; the engine should exit its loop.
    pub abort: bool,
}

impl PendingRequests {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infer.is_empty() && self.kill.is_empty()
    }
}

/// The engine's view of request transport.
///
/// Signals handed to [`deliver`](Gateway::deliver) are numbered by epoch;
/// [`delivered_epoch`](Gateway::delivered_epoch) reports the highest epoch
/// whose signals have all been invoked.
pub trait Gateway: Send + Sync {
    /// Take up to `max_infer` generation requests (oldest first) and all
    /// pending kill requests. Requests beyond `max_infer` stay queued.
    ///
    /// With `blocking`, waits until something arrives or the gateway
    /// shuts down.
    fn pull_pending(&self, max_infer: usize, blocking: bool) -> PendingRequests;

    /// Queue a batch of signals for the output stage and return its epoch.
    fn deliver(&self, signals: Vec<Signal>) -> u64;

    fn delivered_epoch(&self) -> u64;
}
