//! Token layout kernels: per-slot output rows and the step-major history

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use cudarc::driver::LaunchAsync;

use turbine::dtype::DType;
use turbine::tensor::Tensor;
use turbine::{Error, Result};

use super::{ensure_module, kernel, linear_config};
use crate::inner::{CudaContext, CudaTensor};

const PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/layout.ptx"));
const MODULE_NAME: &str = "layout";
const KERNEL_NAMES: &[&str] = &["transpose_history", "append_tokens"];

/// `history[p * batch + i] = output_ids[i, p]` for `i < batch`, `p < max_len`.
///
/// # Errors
/// Returns an error for non-u32 tensors, undersized buffers or a failed
/// launch.
pub fn transpose_history(
    ctx: &CudaContext,
    output_ids: &CudaTensor,
    history: &mut CudaTensor,
    batch: usize,
    max_len: usize,
) -> Result<()> {
    output_ids.expect_dtype("output_ids", DType::U32)?;
    history.expect_dtype("history", DType::U32)?;
    let session_len = output_ids.row_numel();
    if batch > output_ids.rows() || max_len > session_len || history.numel() < batch * max_len {
        return Err(Error::InvalidShape(format!(
            "cannot transpose {batch}x{max_len} tokens from {:?} into {} entries",
            output_ids.shape(),
            history.numel()
        )));
    }
    if batch * max_len == 0 {
        return Ok(());
    }

    let device = ctx.device();
    ensure_module(device, MODULE_NAME, PTX, KERNEL_NAMES)?;
    let func = kernel(device, MODULE_NAME, "transpose_history")?;
    unsafe {
        func.launch(
            linear_config(batch * max_len),
            (
                output_ids.bytes(),
                history.bytes_mut(),
                batch as i32,
                max_len as i32,
                session_len as i32,
            ),
        )?;
    }
    Ok(())
}

/// Write `sampled[i]` to `history[step * stride + i]` and
/// `output_ids[i, positions[i]]` for `i < count`.
///
/// Positions are not read back to the host; a row whose position is past
/// the session length only gets its history entry.
///
/// # Errors
/// Returns an error for non-u32 tensors, undersized buffers or a failed
/// launch.
#[allow(clippy::too_many_arguments)]
pub fn append_tokens(
    ctx: &CudaContext,
    sampled: &CudaTensor,
    positions: &CudaTensor,
    count: usize,
    stride: usize,
    step: usize,
    history: &mut CudaTensor,
    output_ids: &mut CudaTensor,
) -> Result<()> {
    for (name, tensor) in [
        ("sampled", sampled),
        ("positions", positions),
        ("history", &*history),
        ("output_ids", &*output_ids),
    ] {
        tensor.expect_dtype(name, DType::U32)?;
    }
    if sampled.numel() < count || positions.numel() < count || output_ids.rows() < count || stride < count {
        return Err(Error::InvalidShape(format!(
            "append of {count} tokens (stride {stride}) with {} sampled and {} positions",
            sampled.numel(),
            positions.numel()
        )));
    }
    if count == 0 {
        return Ok(());
    }
    if history.numel() < step * stride + count {
        return Err(Error::IndexOutOfRange {
            index: step * stride + count - 1,
            len: history.numel(),
        });
    }
    let session_len = output_ids.row_numel();

    let device = ctx.device();
    ensure_module(device, MODULE_NAME, PTX, KERNEL_NAMES)?;
    let func = kernel(device, MODULE_NAME, "append_tokens")?;
    unsafe {
        func.launch(
            linear_config(count),
            (
                sampled.bytes(),
                positions.bytes(),
                history.bytes_mut(),
                output_ids.bytes_mut(),
                count as i32,
                stride as i32,
                step as i32,
                session_len as i32,
            ),
        )?;
    }
    Ok(())
}
