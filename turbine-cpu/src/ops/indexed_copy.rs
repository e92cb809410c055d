//! Row scatter/gather between host tensors.

use turbine::backend::{validate_indexed_copy, CopyPair};
use turbine::tensor::Tensor;
use turbine::Result;

use crate::tensor::CpuTensor;

/// Copy row `src_idx[k]` to row `dst_idx[k]` for every pair.
///
/// # Errors
/// Returns an error if the indices or row layouts are invalid; no pair is
/// touched in that case.
pub fn indexed_copy(
    src_idx: &[usize],
    dst_idx: &[usize],
    count: usize,
    pairs: &mut [CopyPair<'_, CpuTensor>],
) -> Result<()> {
    validate_indexed_copy(src_idx, dst_idx, count, pairs)?;
    let index = |idx: &[usize], k: usize| if idx.is_empty() { k } else { idx[k] };

    for pair in pairs.iter_mut() {
        let row_bytes = pair.src.row_numel() * pair.src.dtype().size_in_bytes();
        if row_bytes == 0 {
            continue;
        }
        let src = pair.src.as_bytes();
        let dst = pair.dst.as_bytes_mut();
        for k in 0..count {
            let s = index(src_idx, k) * row_bytes;
            let d = index(dst_idx, k) * row_bytes;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compacts_rows_and_leaves_the_rest() {
        let src = CpuTensor::from_slice(&[4, 2], &[0u32, 0, 1, 1, 2, 2, 3, 3]);
        let mut dst = CpuTensor::from_slice(&[4, 2], &[9u32; 8]);
        let rng_src = CpuTensor::from_slice(&[4], &[10u64, 11, 12, 13]);
        let mut rng_dst = CpuTensor::zeros(&[4], turbine::DType::U64);

        let mut pairs = [
            CopyPair { src: &src, dst: &mut dst },
            CopyPair { src: &rng_src, dst: &mut rng_dst },
        ];
        indexed_copy(&[3, 1], &[0, 1], 2, &mut pairs).unwrap();

        assert_eq!(dst.as_slice::<u32>().unwrap(), &[3, 3, 1, 1, 9, 9, 9, 9]);
        assert_eq!(rng_dst.as_slice::<u64>().unwrap(), &[13, 11, 0, 0]);
    }

    #[test]
    fn empty_index_lists_copy_the_prefix() {
        let src = CpuTensor::from_slice(&[3], &[1.0f32, 2.0, 3.0]);
        let mut dst = CpuTensor::zeros(&[3], turbine::DType::F32);
        let mut pairs = [CopyPair { src: &src, dst: &mut dst }];
        indexed_copy(&[], &[], 2, &mut pairs).unwrap();
        assert_eq!(dst.as_slice::<f32>().unwrap(), &[1.0, 2.0, 0.0]);
    }

    #[test]
    fn rejects_out_of_range_without_writing() {
        let src = CpuTensor::from_slice(&[2], &[1u32, 2]);
        let mut dst = CpuTensor::zeros(&[2], turbine::DType::U32);
        let mut pairs = [CopyPair { src: &src, dst: &mut dst }];
        assert!(indexed_copy(&[0], &[5], 1, &mut pairs).is_err());
        assert_eq!(dst.as_slice::<u32>().unwrap(), &[0, 0]);
    }
}
