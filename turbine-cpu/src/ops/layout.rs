//! Conversions between per-slot token rows and the step-major history.

use turbine::tensor::Tensor;
use turbine::{Error, Result};

use crate::tensor::CpuTensor;

/// `history[p * batch + i] = output_ids[i, p]` for `i < batch`, `p < max_len`.
///
/// # Errors
/// Returns an error for non-u32 tensors or undersized buffers.
pub fn transpose_history(
    output_ids: &CpuTensor,
    history: &mut CpuTensor,
    batch: usize,
    max_len: usize,
) -> Result<()> {
    let session_len = output_ids.row_numel();
    if batch > output_ids.rows() || max_len > session_len {
        return Err(Error::InvalidShape(format!(
            "cannot read {batch}x{max_len} tokens from output ids {:?}",
            output_ids.shape()
        )));
    }
    let ids = output_ids.as_slice::<u32>()?;
    let hist = history.as_mut_slice::<u32>()?;
    if hist.len() < batch * max_len {
        return Err(Error::InvalidShape(format!(
            "history of {} entries cannot hold {batch}x{max_len}",
            hist.len()
        )));
    }
    for i in 0..batch {
        for p in 0..max_len {
            hist[p * batch + i] = ids[i * session_len + p];
        }
    }
    Ok(())
}

/// Write `sampled[i]` to `history[step * stride + i]` and
/// `output_ids[i, positions[i]]` for `i < count`.
///
/// # Errors
/// Returns an error for non-u32 tensors or out-of-range positions.
pub fn append_tokens(
    sampled: &CpuTensor,
    positions: &CpuTensor,
    count: usize,
    stride: usize,
    step: usize,
    history: &mut CpuTensor,
    output_ids: &mut CpuTensor,
) -> Result<()> {
    let session_len = output_ids.row_numel();
    let sampled = sampled.as_slice::<u32>()?;
    let positions = positions.as_slice::<u32>()?;
    if sampled.len() < count || positions.len() < count || output_ids.rows() < count || stride < count {
        return Err(Error::InvalidShape(format!(
            "append of {count} tokens (stride {stride}) with {} sampled and {} positions",
            sampled.len(),
            positions.len()
        )));
    }
    let hist = history.as_mut_slice::<u32>()?;
    if count > 0 && hist.len() < step * stride + count {
        return Err(Error::IndexOutOfRange {
            index: step * stride + count - 1,
            len: hist.len(),
        });
    }
    let ids = output_ids.as_mut_slice::<u32>()?;
    for i in 0..count {
        let pos = positions[i] as usize;
        if pos >= session_len {
            return Err(Error::IndexOutOfRange {
                index: pos,
                len: session_len,
            });
        }
        hist[step * stride + i] = sampled[i];
        ids[i * session_len + pos] = sampled[i];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use turbine::DType;

    use super::*;

    #[test]
    fn transpose_is_step_major() {
        let ids = CpuTensor::from_slice(&[3, 4], &[1u32, 2, 3, 0, 4, 5, 6, 0, 7, 8, 9, 0]);
        let mut hist = CpuTensor::zeros(&[8], DType::U32);
        transpose_history(&ids, &mut hist, 2, 3).unwrap();
        assert_eq!(hist.as_slice::<u32>().unwrap(), &[1, 4, 2, 5, 3, 6, 0, 0]);
    }

    #[test]
    fn append_writes_both_layouts() {
        let mut ids = CpuTensor::zeros(&[2, 4], DType::U32);
        let mut hist = CpuTensor::zeros(&[8], DType::U32);
        let sampled = CpuTensor::from_slice(&[2], &[11u32, 22]);
        let positions = CpuTensor::from_slice(&[2], &[1u32, 3]);

        append_tokens(&sampled, &positions, 2, 2, 2, &mut hist, &mut ids).unwrap();

        assert_eq!(ids.as_slice::<u32>().unwrap(), &[0, 11, 0, 0, 0, 0, 0, 22]);
        assert_eq!(&hist.as_slice::<u32>().unwrap()[4..6], &[11, 22]);
    }

    #[test]
    fn append_skips_rows_past_count() {
        // Three rows laid out with stride 3, only the first two sampled.
        let mut ids = CpuTensor::zeros(&[3, 2], DType::U32);
        let mut hist = CpuTensor::from_slice(&[6], &[1u32, 2, 3, 0, 0, 0]);
        let sampled = CpuTensor::from_slice(&[3], &[7u32, 8, 9]);
        let positions = CpuTensor::from_slice(&[3], &[1u32, 1, 1]);

        append_tokens(&sampled, &positions, 2, 3, 1, &mut hist, &mut ids).unwrap();

        assert_eq!(hist.as_slice::<u32>().unwrap(), &[1, 2, 3, 7, 8, 0]);
        assert_eq!(ids.as_slice::<u32>().unwrap(), &[0, 7, 0, 8, 0, 0]);
    }

    #[test]
    fn append_rejects_position_past_session() {
        let mut ids = CpuTensor::zeros(&[1, 2], DType::U32);
        let mut hist = CpuTensor::zeros(&[4], DType::U32);
        let sampled = CpuTensor::from_slice(&[1], &[5u32]);
        let positions = CpuTensor::from_slice(&[1], &[2u32]);
        assert!(append_tokens(&sampled, &positions, 1, 1, 0, &mut hist, &mut ids).is_err());
    }
}
