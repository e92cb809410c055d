//! Model forward and dynamic decode collaborator traits.
//!
//! Both exchange data with the engine through a [`TensorMap`]. The names
//! below are fixed; shapes are validated by the consumer with
//! [`TensorMap::expect`].
//!
//! Model forward inputs:
//!
//! | name              | dtype | shape                |
//! |-------------------|-------|----------------------|
//! | `input_ids`       | u32   | `[num_tokens]`       |
//! | `input_lengths`   | u32   | `[batch]`            |
//! | `context_lengths` | u32   | `[batch]`            |
//! | `cu_block_counts` | u32   | `[batch + 1]`        |
//! | `block_ptrs`      | u64   | `[total_blocks]`     |
//! | `rope_theta`      | f32   | `[batch]`            |
//!
//! Model forward outputs: `logits` `[batch, padded_vocab]` in the model's
//! logits dtype, and `last_hidden_state` `[batch, hidden]` when present in
//! the map.
//!
//! Dynamic decode inputs: `logits` (as above) and `history`, u32, laid out
//! `[position, batch]`. Outputs: `sampled_ids` u32 `[max_batch]` (first
//! `batch` entries written) and `rng_state` u64 `[max_batch]`.

use crate::backend::Backend;
use crate::dtype::DType;
use crate::tensor_map::TensorMap;
use crate::Result;

pub const INPUT_IDS: &str = "input_ids";
pub const INPUT_LENGTHS: &str = "input_lengths";
pub const CONTEXT_LENGTHS: &str = "context_lengths";
pub const CU_BLOCK_COUNTS: &str = "cu_block_counts";
pub const BLOCK_PTRS: &str = "block_ptrs";
pub const ROPE_THETA: &str = "rope_theta";
pub const LOGITS: &str = "logits";
pub const LAST_HIDDEN_STATE: &str = "last_hidden_state";
pub const HISTORY: &str = "history";
pub const SAMPLED_IDS: &str = "sampled_ids";
pub const RNG_STATE: &str = "rng_state";

/// The transformer forward pass.
pub trait ModelForward<B: Backend>: Send {
    fn vocab_size(&self) -> usize;

    /// Width of a logits row; columns past `vocab_size` are padding.
    fn padded_vocab_size(&self) -> usize {
        self.vocab_size()
    }

    fn hidden_size(&self) -> usize;

    /// Element type of the `logits` and `last_hidden_state` outputs.
    fn logits_dtype(&self) -> DType {
        DType::F32
    }

    /// Run one step. Row `i` of `logits` belongs to the last input token of
    /// batch entry `i`.
    ///
    /// # Errors
    /// Returns an error if the inputs fail validation or the device fails.
    fn forward(
        &mut self,
        backend: &B,
        inputs: &TensorMap<'_, B::Tensor>,
        outputs: &mut TensorMap<'_, B::Tensor>,
    ) -> Result<()>;
}

/// Per-slot sampling parameters handed to [`DynamicDecode::setup`].
#[derive(Debug, Clone, Default)]
pub struct SlotSampling {
    pub top_k: u32,
    pub top_p: f32,
    pub min_p: f32,
    pub bad_ids: Vec<Vec<u32>>,
}

/// Scalar arguments of one decode call.
#[derive(Debug, Clone, Copy)]
pub struct DecodeStep {
    /// History row the sampled tokens will be written to.
    pub step: usize,
    /// Number of rows to sample.
    pub batch_size: usize,
    /// Batch width of the history layout.
    pub history_stride: usize,
    pub vocab_size: usize,
}

/// The token sampler.
pub trait DynamicDecode<B: Backend>: Send {
    /// Configure the sampler for the rows of the next iterations. Called
    /// whenever the composition of the batch changes.
    ///
    /// # Errors
    /// Returns an error if the parameters are unsupported.
    fn setup(&mut self, backend: &B, slots: &[SlotSampling]) -> Result<()>;

    /// Sample one token per row from penalized logits.
    ///
    /// # Errors
    /// Returns an error if the tensors fail validation or the device fails.
    fn forward(
        &mut self,
        backend: &B,
        step: DecodeStep,
        inputs: &TensorMap<'_, B::Tensor>,
        outputs: &mut TensorMap<'_, B::Tensor>,
    ) -> Result<()>;
}
