//! CUDA backend for Turbine
//!
//! Device tensors, the penalty/layout/indexed-copy kernels, comm buffers
//! backed by a device buffer pool, and (with `nccl`) the broadcast of
//! sampled ids across tensor-parallel ranks.
//!
//! Without the `cuda` feature the crate compiles as an empty shell, which
//! lets the workspace build and lint on machines without a CUDA toolkit.

// All CUDA modules live inside `inner` so the feature gate stays in one
// place.
#[cfg(feature = "cuda")]
mod inner;

#[cfg(feature = "cuda")]
pub use inner::*;

pub use turbine::DType;
pub use turbine::Error;
pub use turbine::Result;
pub use turbine::Tensor;
