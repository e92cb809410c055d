mod backend_impl;
pub mod buffer_pool;
mod context;
#[cfg(feature = "nccl")]
pub mod nccl;
pub mod ops;
mod tensor;

pub use backend_impl::CudaBackend;
pub use buffer_pool::BufferPool;
pub use context::CudaContext;
#[cfg(feature = "nccl")]
pub use nccl::{NcclCommunicator, NcclId};
pub use tensor::CudaTensor;

pub use cudarc::driver::{CudaDevice, CudaSlice};
