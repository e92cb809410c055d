//! Error types for Turbine

use thiserror::Error;

use crate::dtype::DType;

/// Result type alias using Turbine's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Turbine operations
///
/// Per-request outcomes (rejected, cancelled, too long, ...) are not errors
/// at this level: they travel to the caller as a
/// [`RequestStatus`](crate::request::RequestStatus) inside a signal.
/// An `Error` escaping the engine means the iteration itself failed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("CUDA error: {0}")]
    Cuda(String),

    #[error("NVRTC error: {0}")]
    Nvrtc(String),

    #[error("NCCL error: {0}")]
    Nccl(String),

    #[error("Shape mismatch for `{name}`: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Dtype mismatch for `{name}`: expected {expected}, got {got}")]
    DtypeMismatch {
        name: String,
        expected: DType,
        got: DType,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(DType),

    #[error("Tensor `{0}` not found in tensor map")]
    MissingTensor(String),

    #[error("Index {index} out of range for {len} rows")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Token id {token} at history position {position} of row {row} is outside vocabulary of size {vocab_size}")]
    InvalidTokenId {
        token: u32,
        row: usize,
        position: usize,
        vocab_size: usize,
    },

    #[error("Out of device memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Sequence error: {0}")]
    Sequence(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Optional From impls for cudarc error types (enabled by `cuda-errors` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "cuda-errors")]
impl From<cudarc::driver::DriverError> for Error {
    fn from(e: cudarc::driver::DriverError) -> Self {
        Self::Cuda(e.to_string())
    }
}

#[cfg(feature = "cuda-errors")]
impl From<cudarc::nvrtc::result::NvrtcError> for Error {
    fn from(e: cudarc::nvrtc::result::NvrtcError) -> Self {
        Self::Nvrtc(format!("{e:?}"))
    }
}

#[cfg(feature = "nccl-errors")]
impl From<cudarc::nccl::result::NcclError> for Error {
    fn from(e: cudarc::nccl::result::NcclError) -> Self {
        Self::Nccl(format!("{e:?}"))
    }
}
