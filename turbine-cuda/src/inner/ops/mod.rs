//! Device kernels and their launch wrappers.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaFunction, LaunchConfig};

use turbine::{Error, Result};

pub mod indexed_copy;
pub mod layout;
pub mod penalty;

pub use indexed_copy::indexed_copy;
pub use layout::{append_tokens, transpose_history};
pub use penalty::{apply_min_length_penalty, apply_repetition_penalty, apply_temperature};

/// Threads per block for the element-wise kernels.
const BLOCK_SIZE: u32 = 256;

/// Load `ptx` as `module` unless its first kernel is already present.
fn ensure_module(
    device: &Arc<CudaDevice>,
    module: &'static str,
    ptx: &'static str,
    names: &'static [&'static str],
) -> Result<()> {
    if !device.has_func(module, names[0]) {
        device.load_ptx(cudarc::nvrtc::Ptx::from_src(ptx), module, names)?;
        tracing::debug!(module, kernels = names.len(), "loaded PTX module");
    }
    Ok(())
}

fn kernel(device: &Arc<CudaDevice>, module: &str, name: &str) -> Result<CudaFunction> {
    device
        .get_func(module, name)
        .ok_or_else(|| Error::Cuda(format!("kernel `{module}::{name}` is not loaded")))
}

/// One thread per element over `n` elements.
#[allow(clippy::cast_possible_truncation)]
fn linear_config(n: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: ((n as u32).div_ceil(BLOCK_SIZE).max(1), 1, 1),
        block_dim: (BLOCK_SIZE, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// One block per row.
#[allow(clippy::cast_possible_truncation)]
fn row_config(rows: usize, block: u32) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (rows as u32, 1, 1),
        block_dim: (block, 1, 1),
        shared_mem_bytes: 0,
    }
}
