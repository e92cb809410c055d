//! CPU backend for Turbine.
//!
//! Every op runs synchronously on the calling thread (rows fan out over
//! rayon), so [`Backend::synchronize`] is a no-op. Float logits may be f32,
//! f16 or bf16; arithmetic is always done in f32.
//!
//! This backend is intended for testing the scheduler and for running on
//! machines without a GPU. There is a single rank, so comm buffers are plain
//! pooled host buffers and a broadcast from rank 0 leaves them unchanged.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod comm;
pub mod decode;
pub mod ops;
pub mod tensor;

use half::{bf16, f16};

use turbine::backend::{Backend, CommBufferOps, CopyPair, IndexedCopyOps, LayoutOps, PenaltyOps};
use turbine::dtype::{DType, LogitDType, TensorDType};
use turbine::penalty::{RepetitionParams, Temperature};
use turbine::tensor::Tensor;
use turbine::{Error, Result};

pub use comm::HostBufferPool;
pub use decode::HostSampler;
pub use tensor::CpuTensor;

use ops::penalty::RowTemperature;

/// The CPU backend.
///
/// All op trait impls are on this type. Cloning shares the comm-buffer pool.
#[derive(Clone, Default)]
pub struct CpuBackend {
    comm_pool: HostBufferPool,
}

impl CpuBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool backing the comm buffers.
    #[must_use]
    pub fn comm_pool(&self) -> &HostBufferPool {
        &self.comm_pool
    }
}

fn check_range(tensor: &CpuTensor, offset: usize, len: usize) -> Result<()> {
    if offset + len > tensor.numel() {
        return Err(Error::IndexOutOfRange {
            index: offset + len,
            len: tensor.numel(),
        });
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn zeros(&self, shape: &[usize], dtype: DType) -> Result<CpuTensor> {
        Ok(CpuTensor::zeros(shape, dtype))
    }

    fn upload<T: TensorDType>(&self, dst: &mut CpuTensor, offset: usize, data: &[T]) -> Result<()> {
        check_range(dst, offset, data.len())?;
        dst.as_mut_slice::<T>()?[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download<T: TensorDType>(&self, src: &CpuTensor, offset: usize, len: usize) -> Result<Vec<T>> {
        check_range(src, offset, len)?;
        Ok(src.as_slice::<T>()?[offset..offset + len].to_vec())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

fn temperature_impl<T: LogitDType>(
    logits: &mut CpuTensor,
    bias: Option<&CpuTensor>,
    temperature: Temperature<'_, CpuTensor>,
    vocab_size: usize,
) -> Result<()> {
    let padded = logits.row_numel().max(1);
    let bias = bias.map(CpuTensor::as_slice::<T>).transpose()?;
    let temperature = match temperature {
        Temperature::Scalar(t) => RowTemperature::Scalar(t),
        Temperature::PerRow(t) => RowTemperature::PerRow(t.as_slice::<f32>()?),
    };
    ops::penalty::apply_temperature(
        logits.as_mut_slice::<T>()?,
        padded,
        vocab_size,
        bias,
        temperature,
    )
}

fn repetition_impl<T: LogitDType>(
    logits: &mut CpuTensor,
    penalties: &CpuTensor,
    history: &CpuTensor,
    input_lengths: Option<&CpuTensor>,
    params: RepetitionParams,
) -> Result<()> {
    let padded = logits.row_numel().max(1);
    let input_lengths = input_lengths.map(CpuTensor::as_slice::<u32>).transpose()?;
    ops::penalty::apply_repetition_penalty(
        logits.as_mut_slice::<T>()?,
        padded,
        penalties.as_slice::<f32>()?,
        history.as_slice::<u32>()?,
        input_lengths,
        params,
    )
}

fn min_length_impl<T: LogitDType>(
    logits: &mut CpuTensor,
    min_lengths: &CpuTensor,
    sequence_lengths: &CpuTensor,
    end_ids: &CpuTensor,
    vocab_size: usize,
) -> Result<()> {
    let padded = logits.row_numel().max(1);
    ops::penalty::apply_min_length_penalty(
        logits.as_mut_slice::<T>()?,
        padded,
        vocab_size,
        min_lengths.as_slice::<u32>()?,
        sequence_lengths.as_slice::<u32>()?,
        end_ids.as_slice::<u32>()?,
    )
}

impl PenaltyOps for CpuBackend {
    fn apply_temperature(
        &self,
        logits: &mut CpuTensor,
        bias: Option<&CpuTensor>,
        temperature: Temperature<'_, CpuTensor>,
        vocab_size: usize,
    ) -> Result<()> {
        match logits.dtype() {
            DType::F32 => temperature_impl::<f32>(logits, bias, temperature, vocab_size),
            DType::F16 => temperature_impl::<f16>(logits, bias, temperature, vocab_size),
            DType::BF16 => temperature_impl::<bf16>(logits, bias, temperature, vocab_size),
            other => Err(Error::UnsupportedDtype(other)),
        }
    }

    fn apply_repetition_penalty(
        &self,
        logits: &mut CpuTensor,
        penalties: &CpuTensor,
        history: &CpuTensor,
        input_lengths: Option<&CpuTensor>,
        params: RepetitionParams,
    ) -> Result<()> {
        match logits.dtype() {
            DType::F32 => repetition_impl::<f32>(logits, penalties, history, input_lengths, params),
            DType::F16 => repetition_impl::<f16>(logits, penalties, history, input_lengths, params),
            DType::BF16 => {
                repetition_impl::<bf16>(logits, penalties, history, input_lengths, params)
            }
            other => Err(Error::UnsupportedDtype(other)),
        }
    }

    fn apply_min_length_penalty(
        &self,
        logits: &mut CpuTensor,
        min_lengths: &CpuTensor,
        sequence_lengths: &CpuTensor,
        end_ids: &CpuTensor,
        vocab_size: usize,
    ) -> Result<()> {
        match logits.dtype() {
            DType::F32 => {
                min_length_impl::<f32>(logits, min_lengths, sequence_lengths, end_ids, vocab_size)
            }
            DType::F16 => {
                min_length_impl::<f16>(logits, min_lengths, sequence_lengths, end_ids, vocab_size)
            }
            DType::BF16 => {
                min_length_impl::<bf16>(logits, min_lengths, sequence_lengths, end_ids, vocab_size)
            }
            other => Err(Error::UnsupportedDtype(other)),
        }
    }
}

impl IndexedCopyOps for CpuBackend {
    fn indexed_copy(
        &self,
        src_idx: &[usize],
        dst_idx: &[usize],
        count: usize,
        pairs: &mut [CopyPair<'_, CpuTensor>],
    ) -> Result<()> {
        ops::indexed_copy::indexed_copy(src_idx, dst_idx, count, pairs)
    }
}

impl LayoutOps for CpuBackend {
    fn transpose_history(
        &self,
        output_ids: &CpuTensor,
        history: &mut CpuTensor,
        batch: usize,
        max_len: usize,
    ) -> Result<()> {
        ops::layout::transpose_history(output_ids, history, batch, max_len)
    }

    fn append_tokens(
        &self,
        sampled: &CpuTensor,
        positions: &CpuTensor,
        count: usize,
        stride: usize,
        step: usize,
        history: &mut CpuTensor,
        output_ids: &mut CpuTensor,
    ) -> Result<()> {
        ops::layout::append_tokens(sampled, positions, count, stride, step, history, output_ids)
    }
}

impl CommBufferOps for CpuBackend {
    fn alloc_comm_buffer(&self, shape: &[usize], dtype: DType, register: bool) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        let words = tensor::words_for(numel * dtype.size_in_bytes());
        let storage = self
            .comm_pool
            .acquire(words)
            .unwrap_or_else(|| vec![0; words]);
        tracing::trace!(?shape, %dtype, register, "allocated comm buffer");
        Ok(CpuTensor::from_storage(storage, shape, dtype))
    }

    fn free_comm_buffer(&self, buffer: CpuTensor) {
        self.comm_pool.release(buffer.into_storage());
    }

    fn broadcast_comm_buffer(&self, _buffer: &mut CpuTensor, root: usize) -> Result<()> {
        if root != 0 {
            return Err(Error::Other(format!(
                "broadcast root {root} out of range for a single rank"
            )));
        }
        Ok(())
    }
}
