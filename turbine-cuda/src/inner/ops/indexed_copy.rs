//! Row gather/scatter between device tensors

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use cudarc::driver::{CudaSlice, DevicePtr, LaunchAsync};

use turbine::backend::{validate_indexed_copy, CopyPair};
use turbine::tensor::Tensor;
use turbine::Result;

use super::{ensure_module, kernel, row_config, BLOCK_SIZE};
use crate::inner::{CudaContext, CudaTensor};

const PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/indexed_copy.ptx"));
const MODULE_NAME: &str = "indexed_copy";
const KERNEL_NAMES: &[&str] = &["indexed_copy_rows"];

fn upload_indices(ctx: &CudaContext, idx: &[usize]) -> Result<Option<CudaSlice<u32>>> {
    if idx.is_empty() {
        return Ok(None);
    }
    let idx: Vec<u32> = idx.iter().map(|&i| i as u32).collect();
    Ok(Some(ctx.device().htod_sync_copy(&idx)?))
}

fn nullable_ptr(slice: Option<&CudaSlice<u32>>) -> u64 {
    slice.map_or(0, |s| *s.device_ptr())
}

/// Copy row `src_idx[k]` to row `dst_idx[k]` for every pair; an empty
/// index list stands for `0..count`.
///
/// # Errors
/// Returns an error if the indices or row layouts are invalid, in which
/// case nothing is launched, or if a launch fails.
pub fn indexed_copy(
    ctx: &CudaContext,
    src_idx: &[usize],
    dst_idx: &[usize],
    count: usize,
    pairs: &mut [CopyPair<'_, CudaTensor>],
) -> Result<()> {
    validate_indexed_copy(src_idx, dst_idx, count, pairs)?;
    if count == 0 {
        return Ok(());
    }

    let device = ctx.device();
    ensure_module(device, MODULE_NAME, PTX, KERNEL_NAMES)?;
    let func = kernel(device, MODULE_NAME, "indexed_copy_rows")?;
    let src_list = upload_indices(ctx, src_idx)?;
    let dst_list = upload_indices(ctx, dst_idx)?;

    for pair in pairs.iter_mut() {
        let row_bytes = (pair.src.row_numel() * pair.src.dtype().size_in_bytes()) as u64;
        if row_bytes == 0 {
            continue;
        }
        unsafe {
            func.clone().launch(
                row_config(count, BLOCK_SIZE),
                (
                    pair.src.bytes(),
                    pair.dst.bytes_mut(),
                    nullable_ptr(src_list.as_ref()),
                    nullable_ptr(dst_list.as_ref()),
                    count as i32,
                    row_bytes,
                ),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use turbine::DType;

    use super::*;

    #[test]
    fn compacts_rows_by_index() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let src = CudaTensor::from_slice(&ctx, &[4, 2], &[0u32, 0, 1, 1, 2, 2, 3, 3]).unwrap();
        let mut dst = CudaTensor::from_slice(&ctx, &[4, 2], &[9u32; 8]).unwrap();

        let mut pairs = [CopyPair { src: &src, dst: &mut dst }];
        indexed_copy(&ctx, &[3, 1], &[0, 1], 2, &mut pairs).unwrap();

        let bytes = ctx.device().dtoh_sync_copy(dst.bytes()).unwrap();
        let out: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(out, vec![3, 3, 1, 1, 9, 9, 9, 9]);
    }

    #[test]
    fn rejects_out_of_range_rows() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let src = CudaTensor::from_slice(&ctx, &[2], &[1u32, 2]).unwrap();
        let mut dst = CudaTensor::zeros(&ctx, &[2], DType::U32).unwrap();
        let mut pairs = [CopyPair { src: &src, dst: &mut dst }];
        assert!(indexed_copy(&ctx, &[0], &[5], 1, &mut pairs).is_err());
    }
}
