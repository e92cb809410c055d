//! Temperature, repetition and minimum-length penalties on device logits

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use cudarc::driver::LaunchAsync;

use turbine::dtype::DType;
use turbine::penalty::{InvalidTokenPolicy, RepetitionMode, RepetitionParams, Temperature};
use turbine::tensor::Tensor;
use turbine::{Error, Result};

use super::{ensure_module, kernel, linear_config, row_config, BLOCK_SIZE};
use crate::inner::{CudaContext, CudaTensor};

const PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/penalty.ptx"));
const MODULE_NAME: &str = "penalty";
const KERNEL_NAMES: &[&str] = &[
    "temperature_f32",
    "temperature_f16",
    "temperature_bf16",
    "temperature_vec2_f32",
    "temperature_vec2_f16",
    "temperature_vec2_bf16",
    "temperature_vec4_f32",
    "temperature_vec4_f16",
    "temperature_vec4_bf16",
    "repetition_penalty_f32",
    "repetition_penalty_f16",
    "repetition_penalty_bf16",
    "min_length_penalty_f32",
    "min_length_penalty_f16",
    "min_length_penalty_bf16",
    "first_invalid_token",
];

fn dtype_suffix(dtype: DType) -> Result<&'static str> {
    match dtype {
        DType::F32 => Ok("f32"),
        DType::F16 => Ok("f16"),
        DType::BF16 => Ok("bf16"),
        other => Err(Error::UnsupportedDtype(other)),
    }
}

fn mode_code(mode: RepetitionMode) -> i32 {
    match mode {
        RepetitionMode::None => 0,
        RepetitionMode::Additive => 1,
        RepetitionMode::Multiplicative => 2,
    }
}

fn check_vocab(logits: &CudaTensor, vocab_size: usize) -> Result<()> {
    if vocab_size > logits.row_numel() {
        return Err(Error::InvalidShape(format!(
            "vocab_size {vocab_size} exceeds padded width {}",
            logits.row_numel()
        )));
    }
    Ok(())
}

fn check_len(name: &str, tensor: &CudaTensor, dtype: DType, min: usize) -> Result<()> {
    tensor.expect_dtype(name, dtype)?;
    if tensor.numel() < min {
        return Err(Error::InvalidShape(format!(
            "`{name}` has {} entries, need {min}",
            tensor.numel()
        )));
    }
    Ok(())
}

/// Widest pack (4, 2 or 1 elements) that divides the row width and matches
/// the alignment of `ptr`.
fn vector_width(padded: usize, ptr: u64, elem_size: usize) -> usize {
    [4, 2]
        .into_iter()
        .find(|&w| padded % w == 0 && ptr % (w * elem_size) as u64 == 0)
        .unwrap_or(1)
}

/// `(logit + bias[v]) / (t + 1e-6)` over the vocabulary, padding columns
/// set to the dtype's lowest finite value. Rows are processed in packs of
/// four or two columns when their width and alignment allow it.
///
/// # Errors
/// Returns an error for non-float logits, mismatched arguments or a failed
/// launch.
pub fn apply_temperature(
    ctx: &CudaContext,
    logits: &mut CudaTensor,
    bias: Option<&CudaTensor>,
    temperature: Temperature<'_, CudaTensor>,
    vocab_size: usize,
) -> Result<()> {
    temperature_with_width(ctx, logits, bias, temperature, vocab_size, None)
}

/// [`apply_temperature`] with a fixed pack width; `None` picks the widest
/// one the logits allow.
pub(crate) fn temperature_with_width(
    ctx: &CudaContext,
    logits: &mut CudaTensor,
    bias: Option<&CudaTensor>,
    temperature: Temperature<'_, CudaTensor>,
    vocab_size: usize,
    width: Option<usize>,
) -> Result<()> {
    let suffix = dtype_suffix(logits.dtype())?;
    check_vocab(logits, vocab_size)?;
    let rows = logits.rows();
    let padded = logits.row_numel();
    let bias_ptr = match bias {
        Some(bias) => {
            check_len("bias", bias, logits.dtype(), vocab_size)?;
            bias.device_ptr()
        }
        None => 0,
    };
    let (temperatures_ptr, scalar) = match temperature {
        Temperature::Scalar(t) => (0, t),
        Temperature::PerRow(t) => {
            check_len("temperature", t, DType::F32, rows)?;
            (t.device_ptr(), 0.0)
        }
    };
    if rows == 0 {
        return Ok(());
    }

    let widest = vector_width(padded, logits.device_ptr(), logits.dtype().size_in_bytes());
    let width = width.unwrap_or(widest);
    if !matches!(width, 1 | 2 | 4) || widest % width != 0 {
        return Err(Error::InvalidShape(format!(
            "pack width {width} does not fit rows of {padded} columns"
        )));
    }
    let name = if width == 1 {
        format!("temperature_{suffix}")
    } else {
        format!("temperature_vec{width}_{suffix}")
    };
    tracing::trace!(rows, padded, width, "temperature");

    let device = ctx.device();
    ensure_module(device, MODULE_NAME, PTX, KERNEL_NAMES)?;
    let func = kernel(device, MODULE_NAME, &name)?;
    unsafe {
        func.launch(
            row_config(rows, BLOCK_SIZE),
            (
                logits.bytes_mut(),
                bias_ptr,
                temperatures_ptr,
                scalar,
                vocab_size as i32,
                padded as i32,
            ),
        )?;
    }
    Ok(())
}

/// Penalize every in-vocabulary token of each row's history once.
///
/// # Errors
/// Returns [`Error::InvalidTokenId`] under [`InvalidTokenPolicy::Reject`]
/// for the first out-of-vocabulary history token, before any logit is
/// touched, and the usual argument and launch errors.
pub fn apply_repetition_penalty(
    ctx: &CudaContext,
    logits: &mut CudaTensor,
    penalties: &CudaTensor,
    history: &CudaTensor,
    input_lengths: Option<&CudaTensor>,
    params: RepetitionParams,
) -> Result<()> {
    let suffix = dtype_suffix(logits.dtype())?;
    check_vocab(logits, params.vocab_size)?;
    let rows = logits.rows();
    let padded = logits.row_numel();
    check_len("penalties", penalties, DType::F32, rows)?;
    history.expect_dtype("history", DType::U32)?;
    if rows > params.history_stride || history.numel() < params.step * params.history_stride {
        return Err(Error::InvalidShape(format!(
            "history of {} entries cannot hold {} steps of stride {} for {rows} rows",
            history.numel(),
            params.step,
            params.history_stride
        )));
    }
    let lengths_ptr = match input_lengths {
        Some(lengths) => {
            check_len("input_lengths", lengths, DType::U32, rows)?;
            lengths.device_ptr()
        }
        None => 0,
    };
    if rows == 0 || params.step == 0 || params.mode == RepetitionMode::None {
        return Ok(());
    }

    let device = ctx.device();
    ensure_module(device, MODULE_NAME, PTX, KERNEL_NAMES)?;
    if params.policy == InvalidTokenPolicy::Reject {
        reject_invalid_tokens(ctx, history, lengths_ptr, rows, params)?;
    }

    let mut scratch = device.alloc_zeros::<f32>(rows * params.step)?;
    let func = kernel(device, MODULE_NAME, &format!("repetition_penalty_{suffix}"))?;
    unsafe {
        func.launch(
            row_config(rows, BLOCK_SIZE),
            (
                logits.bytes_mut(),
                penalties.bytes(),
                history.bytes(),
                lengths_ptr,
                &mut scratch,
                params.vocab_size as i32,
                padded as i32,
                params.step as i32,
                params.history_stride as i32,
                params.max_input_length as i32,
                mode_code(params.mode),
            ),
        )?;
    }
    Ok(())
}

fn reject_invalid_tokens(
    ctx: &CudaContext,
    history: &CudaTensor,
    lengths_ptr: u64,
    rows: usize,
    params: RepetitionParams,
) -> Result<()> {
    let device = ctx.device();
    let mut result = device.htod_sync_copy(&[u32::MAX])?;
    let func = kernel(device, MODULE_NAME, "first_invalid_token")?;
    unsafe {
        func.launch(
            linear_config(rows * params.step),
            (
                history.bytes(),
                lengths_ptr,
                &mut result,
                rows as i32,
                params.step as i32,
                params.history_stride as i32,
                params.max_input_length as i32,
                params.vocab_size as i32,
            ),
        )?;
    }
    let first = device.dtoh_sync_copy(&result)?[0];
    if first == u32::MAX {
        return Ok(());
    }
    let (row, position) = (first as usize / params.step, first as usize % params.step);
    let bytes = device.dtoh_sync_copy(&history.view(position * params.history_stride + row, 1)?)?;
    let token: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
    Err(Error::InvalidTokenId {
        token: token[0],
        row,
        position,
        vocab_size: params.vocab_size,
    })
}

/// Mask the end ids of rows that are still short of their minimum length.
///
/// # Errors
/// Returns an error for mismatched arguments or a failed launch.
pub fn apply_min_length_penalty(
    ctx: &CudaContext,
    logits: &mut CudaTensor,
    min_lengths: &CudaTensor,
    sequence_lengths: &CudaTensor,
    end_ids: &CudaTensor,
    vocab_size: usize,
) -> Result<()> {
    let suffix = dtype_suffix(logits.dtype())?;
    check_vocab(logits, vocab_size)?;
    let rows = logits.rows();
    let padded = logits.row_numel();
    check_len("min_lengths", min_lengths, DType::U32, rows)?;
    check_len("sequence_lengths", sequence_lengths, DType::U32, rows)?;
    end_ids.expect_dtype("end_ids", DType::U32)?;
    if rows == 0 {
        return Ok(());
    }
    if end_ids.numel() % rows != 0 {
        return Err(Error::InvalidShape(format!(
            "{} end ids do not split into {rows} rows",
            end_ids.numel()
        )));
    }
    let end_ids_size = end_ids.numel() / rows;

    let device = ctx.device();
    ensure_module(device, MODULE_NAME, PTX, KERNEL_NAMES)?;
    let func = kernel(device, MODULE_NAME, &format!("min_length_penalty_{suffix}"))?;
    unsafe {
        func.launch(
            row_config(rows, 32),
            (
                logits.bytes_mut(),
                min_lengths.bytes(),
                sequence_lengths.bytes(),
                end_ids.bytes(),
                end_ids_size as i32,
                vocab_size as i32,
                padded as i32,
            ),
        )?;
    }
    Ok(())
}
