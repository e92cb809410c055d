//! Per-iteration generation state.

use std::collections::VecDeque;

use turbine::RequestId;

/// State threaded through one iteration's lifecycle calls.
///
/// Only `min_input_count` carries meaning from one iteration to the next;
/// the rest is rebuilt by `initialize`.
#[derive(Debug, Clone)]
pub struct GenerationState {
    /// History row the next sampled tokens are written to.
    pub step: usize,
    /// Longest context in the batch when sampling was last initialized.
    pub max_init_ctx_len: usize,
    /// 1 when the last active slot is a partially prefilled sequence.
    pub partial: usize,
    /// Full context length of the partial slot; the slot itself holds the
    /// truncated length for the duration of the forward pass.
    pub partial_context_length: usize,
    /// Request ids of the active region, in slot order.
    pub unique_ids: Vec<RequestId>,
    /// Sliding window of per-iteration prefill token counts.
    pub min_input_count: VecDeque<usize>,
    /// Requests finished during the last `finish`.
    pub finished_count: usize,
    /// Sampling parameters from the previous iteration are still valid.
    pub skip_init_sampling: bool,
}

impl GenerationState {
    #[must_use]
    pub fn new(max_prefill_iters: usize) -> Self {
        Self {
            step: 0,
            max_init_ctx_len: 0,
            partial: 0,
            partial_context_length: 0,
            unique_ids: Vec::new(),
            min_input_count: std::iter::repeat_n(0, max_prefill_iters.max(1)).collect(),
            finished_count: 0,
            skip_init_sampling: false,
        }
    }

    /// Number of slots that sample this iteration.
    #[must_use]
    pub fn sampling_rows(&self, active_size: usize) -> usize {
        active_size - self.partial.min(active_size)
    }
}
