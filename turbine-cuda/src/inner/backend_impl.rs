//! Backend trait implementations for the CUDA backend

#[cfg(feature = "nccl")]
use std::sync::Arc;

use turbine::backend::{Backend, CommBufferOps, CopyPair, IndexedCopyOps, LayoutOps, PenaltyOps};
use turbine::dtype::{DType, TensorDType};
use turbine::penalty::{RepetitionParams, Temperature};
use turbine::tensor::Tensor;
use turbine::{Error, Result};

#[cfg(feature = "nccl")]
use super::nccl::NcclCommunicator;
use super::{ops, CudaContext, CudaTensor};

/// The CUDA backend: one device, and with `nccl` the rank's communicator.
#[derive(Clone)]
pub struct CudaBackend {
    ctx: CudaContext,
    #[cfg(feature = "nccl")]
    comm: Option<Arc<NcclCommunicator>>,
}

impl CudaBackend {
    #[must_use]
    pub fn new(ctx: CudaContext) -> Self {
        Self {
            ctx,
            #[cfg(feature = "nccl")]
            comm: None,
        }
    }

    /// Broadcast comm buffers through `comm` instead of treating this
    /// device as the only rank.
    #[cfg(feature = "nccl")]
    #[must_use]
    pub fn with_communicator(mut self, comm: Arc<NcclCommunicator>) -> Self {
        self.comm = Some(comm);
        self
    }

    #[must_use]
    pub fn context(&self) -> &CudaContext {
        &self.ctx
    }
}

impl Backend for CudaBackend {
    type Tensor = CudaTensor;

    fn zeros(&self, shape: &[usize], dtype: DType) -> Result<CudaTensor> {
        CudaTensor::zeros(&self.ctx, shape, dtype)
    }

    fn upload<T: TensorDType>(&self, dst: &mut CudaTensor, offset: usize, data: &[T]) -> Result<()> {
        dst.expect_dtype("upload", T::DTYPE)?;
        let mut view = dst.view_mut(offset, data.len())?;
        if !data.is_empty() {
            self.ctx
                .device()
                .htod_sync_copy_into(bytemuck::cast_slice::<T, u8>(data), &mut view)?;
        }
        Ok(())
    }

    fn download<T: TensorDType>(&self, src: &CudaTensor, offset: usize, len: usize) -> Result<Vec<T>> {
        src.expect_dtype("download", T::DTYPE)?;
        let view = src.view(offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.ctx.device().dtoh_sync_copy(&view)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    fn synchronize(&self) -> Result<()> {
        self.ctx.synchronize()
    }
}

impl PenaltyOps for CudaBackend {
    fn apply_temperature(
        &self,
        logits: &mut CudaTensor,
        bias: Option<&CudaTensor>,
        temperature: Temperature<'_, CudaTensor>,
        vocab_size: usize,
    ) -> Result<()> {
        ops::apply_temperature(&self.ctx, logits, bias, temperature, vocab_size)
    }

    fn apply_repetition_penalty(
        &self,
        logits: &mut CudaTensor,
        penalties: &CudaTensor,
        history: &CudaTensor,
        input_lengths: Option<&CudaTensor>,
        params: RepetitionParams,
    ) -> Result<()> {
        ops::apply_repetition_penalty(&self.ctx, logits, penalties, history, input_lengths, params)
    }

    fn apply_min_length_penalty(
        &self,
        logits: &mut CudaTensor,
        min_lengths: &CudaTensor,
        sequence_lengths: &CudaTensor,
        end_ids: &CudaTensor,
        vocab_size: usize,
    ) -> Result<()> {
        ops::apply_min_length_penalty(
            &self.ctx,
            logits,
            min_lengths,
            sequence_lengths,
            end_ids,
            vocab_size,
        )
    }
}

impl IndexedCopyOps for CudaBackend {
    fn indexed_copy(
        &self,
        src_idx: &[usize],
        dst_idx: &[usize],
        count: usize,
        pairs: &mut [CopyPair<'_, CudaTensor>],
    ) -> Result<()> {
        ops::indexed_copy(&self.ctx, src_idx, dst_idx, count, pairs)
    }
}

impl LayoutOps for CudaBackend {
    fn transpose_history(
        &self,
        output_ids: &CudaTensor,
        history: &mut CudaTensor,
        batch: usize,
        max_len: usize,
    ) -> Result<()> {
        ops::transpose_history(&self.ctx, output_ids, history, batch, max_len)
    }

    fn append_tokens(
        &self,
        sampled: &CudaTensor,
        positions: &CudaTensor,
        count: usize,
        stride: usize,
        step: usize,
        history: &mut CudaTensor,
        output_ids: &mut CudaTensor,
    ) -> Result<()> {
        ops::append_tokens(
            &self.ctx, sampled, positions, count, stride, step, history, output_ids,
        )
    }
}

impl CommBufferOps for CudaBackend {
    fn alloc_comm_buffer(&self, shape: &[usize], dtype: DType, register: bool) -> Result<CudaTensor> {
        let bytes = shape.iter().product::<usize>() * dtype.size_in_bytes();
        let data = self.ctx.buffer_pool().acquire(bytes)?;
        tracing::trace!(?shape, %dtype, register, "allocated comm buffer");
        Ok(CudaTensor::from_bytes(data, shape, dtype))
    }

    fn free_comm_buffer(&self, buffer: CudaTensor) {
        let bytes = buffer.size_in_bytes();
        self.ctx.buffer_pool().release(buffer.into_bytes(), bytes);
    }

    fn broadcast_comm_buffer(&self, buffer: &mut CudaTensor, root: usize) -> Result<()> {
        #[cfg(feature = "nccl")]
        if let Some(comm) = &self.comm {
            return comm.broadcast(buffer, root);
        }
        let _ = buffer;
        if root != 0 {
            return Err(Error::Other(format!(
                "broadcast root {root} out of range for a single rank"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use half::f16;
    use turbine::penalty::{InvalidTokenPolicy, RepetitionMode};
    use turbine_cpu::CpuBackend;

    use super::*;
    use crate::inner::ops::penalty::temperature_with_width;

    fn backend() -> CudaBackend {
        CudaBackend::new(CudaContext::new(0).expect("Failed to create CUDA context"))
    }

    const LOGITS: [f32; 8] = [1.0, -2.0, 3.0, 0.5, 2.0, 4.0, -1.0, 0.0];

    fn packed_temperature<T: TensorDType>(
        gpu: &CudaBackend,
        shape: [usize; 2],
        logits: &[T],
        bias: &[T],
        width: Option<usize>,
    ) -> Result<Vec<T>> {
        let mut t = gpu.from_slice(&shape, logits)?;
        let b = gpu.from_slice(&[bias.len()], bias)?;
        let temps = gpu.from_slice(&[shape[0]], &[0.7f32, 1.3])?;
        temperature_with_width(
            gpu.context(),
            &mut t,
            Some(&b),
            Temperature::PerRow(&temps),
            bias.len(),
            width,
        )?;
        gpu.download::<T>(&t, 0, shape[0] * shape[1])
    }

    #[test]
    fn upload_download_with_offset() {
        let gpu = backend();
        let mut t = gpu.zeros(&[2, 3], DType::U32).unwrap();
        gpu.upload(&mut t, 2, &[7u32, 8]).unwrap();
        assert_eq!(gpu.download::<u32>(&t, 1, 3).unwrap(), vec![0, 7, 8]);
        assert!(gpu.upload(&mut t, 5, &[1u32, 2]).is_err());
        assert!(gpu.download::<f32>(&t, 0, 1).is_err());
    }

    #[test]
    fn temperature_matches_cpu() {
        let gpu = backend();
        let cpu = CpuBackend::new();
        let temps = [0.5f32, 2.0];

        let mut g = gpu.from_slice(&[2, 4], &LOGITS).unwrap();
        let gt = gpu.from_slice(&[2], &temps).unwrap();
        gpu.apply_temperature(&mut g, None, Temperature::PerRow(&gt), 3).unwrap();

        let mut c = cpu.from_slice(&[2, 4], &LOGITS).unwrap();
        let ct = cpu.from_slice(&[2], &temps).unwrap();
        cpu.apply_temperature(&mut c, None, Temperature::PerRow(&ct), 3).unwrap();

        let got = gpu.download::<f32>(&g, 0, 8).unwrap();
        let want = cpu.download::<f32>(&c, 0, 8).unwrap();
        assert_eq!(got, want);
        assert_eq!(got[3], f32::MIN);
    }

    #[test]
    fn packed_temperature_matches_scalar() {
        let gpu = backend();
        let logits: Vec<f32> = (0..16u8).map(|i| (f32::from(i) - 7.5) * 0.37).collect();
        let bias = [0.25f32, -1.0, 0.0, 2.5, -0.125, 1.0];
        let scalar = packed_temperature(&gpu, [2, 8], &logits, &bias, Some(1)).unwrap();
        for width in [Some(2), Some(4), None] {
            assert_eq!(packed_temperature(&gpu, [2, 8], &logits, &bias, width).unwrap(), scalar);
        }
        assert_eq!(scalar[6..8], [f32::MIN; 2]);

        let logits: Vec<f16> = logits.iter().map(|&x| f16::from_f32(x)).collect();
        let bias: Vec<f16> = bias.iter().map(|&x| f16::from_f32(x)).collect();
        let scalar = packed_temperature(&gpu, [2, 8], &logits, &bias, Some(1)).unwrap();
        for width in [Some(2), Some(4)] {
            assert_eq!(packed_temperature(&gpu, [2, 8], &logits, &bias, width).unwrap(), scalar);
        }

        let cpu = CpuBackend::new();
        let mut c = cpu.from_slice(&[2, 8], &logits).unwrap();
        let cb = cpu.from_slice(&[6], &bias).unwrap();
        let ct = cpu.from_slice(&[2], &[0.7f32, 1.3]).unwrap();
        cpu.apply_temperature(&mut c, Some(&cb), Temperature::PerRow(&ct), 6)
            .unwrap();
        assert_eq!(cpu.download::<f16>(&c, 0, 16).unwrap(), scalar);
    }

    #[test]
    fn pack_width_must_divide_the_row() {
        let gpu = backend();
        let logits = [0.5f32; 12];
        let bias = [0.0f32; 6];
        assert!(matches!(
            packed_temperature(&gpu, [2, 6], &logits, &bias, Some(4)),
            Err(Error::InvalidShape(_))
        ));
        let scalar = packed_temperature(&gpu, [2, 6], &logits, &bias, Some(1)).unwrap();
        assert_eq!(packed_temperature(&gpu, [2, 6], &logits, &bias, None).unwrap(), scalar);
    }

    #[test]
    fn f16_repetition_penalty_matches_cpu() {
        let gpu = backend();
        let cpu = CpuBackend::new();
        let logits: Vec<f16> = LOGITS.iter().map(|&x| f16::from_f32(x)).collect();
        // Step-major, two rows: row 0 saw [0, 2, 2], row 1 saw [1, 3].
        let history = [0u32, 1, 2, 3, 2, 0];
        let lengths = [3u32, 2];
        let params = RepetitionParams {
            vocab_size: 4,
            step: 3,
            history_stride: 2,
            max_input_length: 3,
            mode: RepetitionMode::Multiplicative,
            policy: InvalidTokenPolicy::Skip,
        };

        let mut g = gpu.from_slice(&[2, 4], &logits).unwrap();
        let gp = gpu.from_slice(&[2], &[2.0f32, 1.5]).unwrap();
        let gh = gpu.from_slice(&[6], &history).unwrap();
        let gl = gpu.from_slice(&[2], &lengths).unwrap();
        gpu.apply_repetition_penalty(&mut g, &gp, &gh, Some(&gl), params).unwrap();

        let mut c = cpu.from_slice(&[2, 4], &logits).unwrap();
        let cp = cpu.from_slice(&[2], &[2.0f32, 1.5]).unwrap();
        let ch = cpu.from_slice(&[6], &history).unwrap();
        let cl = cpu.from_slice(&[2], &lengths).unwrap();
        cpu.apply_repetition_penalty(&mut c, &cp, &ch, Some(&cl), params).unwrap();

        assert_eq!(
            gpu.download::<f16>(&g, 0, 8).unwrap(),
            cpu.download::<f16>(&c, 0, 8).unwrap()
        );
    }

    #[test]
    fn reject_policy_reports_first_invalid_token() {
        let gpu = backend();
        let mut logits = gpu.from_slice(&[2, 4], &LOGITS).unwrap();
        let penalties = gpu.from_slice(&[2], &[1.0f32, 1.0]).unwrap();
        let history = gpu.from_slice(&[4], &[0u32, 1, 9, 2]).unwrap();
        let params = RepetitionParams {
            vocab_size: 4,
            step: 2,
            history_stride: 2,
            max_input_length: 2,
            mode: RepetitionMode::Additive,
            policy: InvalidTokenPolicy::Reject,
        };
        let err = gpu
            .apply_repetition_penalty(&mut logits, &penalties, &history, None, params)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTokenId { token: 9, row: 0, position: 1, vocab_size: 4 }
        ));
        assert_eq!(gpu.download::<f32>(&logits, 0, 8).unwrap(), LOGITS.to_vec());
    }

    #[test]
    fn min_length_masks_end_ids() {
        let gpu = backend();
        let mut logits = gpu.from_slice(&[2, 4], &LOGITS).unwrap();
        let min_lengths = gpu.from_slice(&[2], &[5u32, 2]).unwrap();
        let seq_lengths = gpu.from_slice(&[2], &[3u32, 3]).unwrap();
        let end_ids = gpu.from_slice(&[2], &[2u32, 2]).unwrap();
        gpu.apply_min_length_penalty(&mut logits, &min_lengths, &seq_lengths, &end_ids, 4)
            .unwrap();
        let out = gpu.download::<f32>(&logits, 0, 8).unwrap();
        assert_eq!(out[2], f32::MIN);
        assert_eq!(out[6], -1.0);
    }

    #[test]
    fn comm_buffers_are_pooled() {
        let gpu = backend();
        let mut buf = gpu.alloc_comm_buffer(&[4], DType::U32, true).unwrap();
        gpu.upload(&mut buf, 0, &[1u32, 2, 3, 4]).unwrap();
        gpu.broadcast_comm_buffer(&mut buf, 0).unwrap();
        gpu.free_comm_buffer(buf);

        let mut buf = gpu.alloc_comm_buffer(&[2], DType::U64, false).unwrap();
        assert_eq!(gpu.context().buffer_pool().hits(), 1);
        assert_eq!(gpu.download::<u64>(&buf, 0, 2).unwrap(), vec![0, 0]);
        #[cfg(not(feature = "nccl"))]
        assert!(gpu.broadcast_comm_buffer(&mut buf, 1).is_err());
        gpu.free_comm_buffer(buf);
    }
}
