//! Backend trait and op traits
//!
//! The scheduler is generic over a backend `B` that supplies tensor storage
//! plus the small set of device ops it needs between forward passes:
//! logit penalties, indexed row copies, history layout, and comm buffers.
//! Every op is stream-ordered; results are only guaranteed visible on the
//! host after [`Backend::synchronize`] or a download.

use crate::dtype::{DType, TensorDType};
use crate::penalty::{RepetitionParams, Temperature};
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Core backend trait: allocation and host transfer.
pub trait Backend: Send + 'static {
    /// Backend tensor type
    type Tensor: Tensor;

    /// Allocate a zero-filled tensor.
    fn zeros(&self, shape: &[usize], dtype: DType) -> Result<Self::Tensor>;

    /// Copy `data` into `dst` starting at element `offset`.
    fn upload<T: TensorDType>(&self, dst: &mut Self::Tensor, offset: usize, data: &[T])
        -> Result<()>;

    /// Copy `len` elements starting at element `offset` back to the host.
    fn download<T: TensorDType>(
        &self,
        src: &Self::Tensor,
        offset: usize,
        len: usize,
    ) -> Result<Vec<T>>;

    /// Wait for all queued work to complete.
    fn synchronize(&self) -> Result<()>;

    /// Allocate a tensor and fill it from host data.
    fn from_slice<T: TensorDType>(&self, shape: &[usize], data: &[T]) -> Result<Self::Tensor> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::InvalidShape(format!(
                "{} elements do not fill shape {shape:?}",
                data.len()
            )));
        }
        let mut tensor = self.zeros(shape, T::DTYPE)?;
        self.upload(&mut tensor, 0, data)?;
        Ok(tensor)
    }
}

/// In-place logit transforms run before sampling.
///
/// `logits` has shape `[rows, padded_vocab]`; columns at or beyond
/// `vocab_size` are padding.
pub trait PenaltyOps: Backend {
    /// `(logit + bias[v]) / (t + 1e-6)` for `v < vocab_size`, the dtype's
    /// most negative finite value for padding columns.
    fn apply_temperature(
        &self,
        logits: &mut Self::Tensor,
        bias: Option<&Self::Tensor>,
        temperature: Temperature<'_, Self::Tensor>,
        vocab_size: usize,
    ) -> Result<()>;

    /// Penalize every token id present in the rows' history.
    ///
    /// `penalties` is f32 `[rows]`, `history` is u32 laid out
    /// `[position, history_stride]`, `input_lengths` is u32 `[rows]`
    /// (defaults to `max_input_length` for every row).
    fn apply_repetition_penalty(
        &self,
        logits: &mut Self::Tensor,
        penalties: &Self::Tensor,
        history: &Self::Tensor,
        input_lengths: Option<&Self::Tensor>,
        params: RepetitionParams,
    ) -> Result<()>;

    /// Mask end ids of rows that have not reached their minimum length.
    ///
    /// `min_lengths` and `sequence_lengths` are u32 `[rows]`; `end_ids` is
    /// u32 `[rows, end_ids_size]` where ids `<= 0` are unset.
    fn apply_min_length_penalty(
        &self,
        logits: &mut Self::Tensor,
        min_lengths: &Self::Tensor,
        sequence_lengths: &Self::Tensor,
        end_ids: &Self::Tensor,
        vocab_size: usize,
    ) -> Result<()>;
}

/// Source and destination of one buffer moved by [`IndexedCopyOps`].
pub struct CopyPair<'a, T> {
    pub src: &'a T,
    pub dst: &'a mut T,
}

/// Row scatter/gather across parallel per-slot buffers.
pub trait IndexedCopyOps: Backend {
    /// For every pair, copy row `src_idx[k]` of `src` to row `dst_idx[k]`
    /// of `dst`, `k < count`. An empty index list means the identity
    /// `0..count`. All pairs are moved as one step on the stream.
    fn indexed_copy(
        &self,
        src_idx: &[usize],
        dst_idx: &[usize],
        count: usize,
        pairs: &mut [CopyPair<'_, Self::Tensor>],
    ) -> Result<()>;
}

/// Conversions between per-slot token rows and the step-major history.
pub trait LayoutOps: Backend {
    /// `history[p * batch + i] = output_ids[i, p]` for `i < batch`,
    /// `p < max_len`. `output_ids` is u32 `[slots, session_len]`.
    fn transpose_history(
        &self,
        output_ids: &Self::Tensor,
        history: &mut Self::Tensor,
        batch: usize,
        max_len: usize,
    ) -> Result<()>;

    /// Append one sampled token for each of the first `count` rows:
    /// `history[step * stride + i]` and `output_ids[i, positions[i]]` both
    /// receive `sampled[i]`.
    #[allow(clippy::too_many_arguments)]
    fn append_tokens(
        &self,
        sampled: &Self::Tensor,
        positions: &Self::Tensor,
        count: usize,
        stride: usize,
        step: usize,
        history: &mut Self::Tensor,
        output_ids: &mut Self::Tensor,
    ) -> Result<()>;
}

/// Device-visible staging buffers for data shared across ranks.
pub trait CommBufferOps: Backend {
    /// Allocate a staging buffer. With `register`, the buffer is also made
    /// reachable by the backend's communicator.
    fn alloc_comm_buffer(
        &self,
        shape: &[usize],
        dtype: DType,
        register: bool,
    ) -> Result<Self::Tensor>;

    /// Return a staging buffer to the pool.
    fn free_comm_buffer(&self, buffer: Self::Tensor);

    /// Make every rank's copy of `buffer` equal to `root`'s.
    fn broadcast_comm_buffer(&self, buffer: &mut Self::Tensor, root: usize) -> Result<()>;
}

/// Bounds-check the arguments of an indexed copy.
///
/// # Errors
/// Returns [`Error::InvalidShape`] for mismatched lists or row sizes and
/// [`Error::IndexOutOfRange`] for indices past the last row.
pub fn validate_indexed_copy<T: Tensor>(
    src_idx: &[usize],
    dst_idx: &[usize],
    count: usize,
    pairs: &[CopyPair<'_, T>],
) -> Result<()> {
    for (name, idx) in [("src", src_idx), ("dst", dst_idx)] {
        if !idx.is_empty() && idx.len() != count {
            return Err(Error::InvalidShape(format!(
                "{name} index list has {} entries, expected {count}",
                idx.len()
            )));
        }
    }
    for pair in pairs {
        if pair.src.dtype() != pair.dst.dtype() || pair.src.row_numel() != pair.dst.row_numel() {
            return Err(Error::InvalidShape(format!(
                "row layout differs between {:?} {} and {:?} {}",
                pair.src.shape(),
                pair.src.dtype(),
                pair.dst.shape(),
                pair.dst.dtype()
            )));
        }
        for (idx, rows) in [(src_idx, pair.src.rows()), (dst_idx, pair.dst.rows())] {
            let max = if idx.is_empty() {
                count.checked_sub(1)
            } else {
                idx.iter().copied().max()
            };
            if let Some(index) = max.filter(|&i| i >= rows) {
                return Err(Error::IndexOutOfRange { index, len: rows });
            }
        }
    }
    Ok(())
}
