//! CUDA context management

use std::sync::Arc;

use cudarc::driver::CudaDevice;

use super::buffer_pool::BufferPool;
use turbine::Result;

/// A CUDA device together with the buffer pool its comm buffers come from.
///
/// Cloning is cheap and shares both.
#[derive(Clone)]
pub struct CudaContext {
    device: Arc<CudaDevice>,
    buffer_pool: BufferPool,
}

impl CudaContext {
    /// Create a context for the device with the given ordinal.
    ///
    /// # Errors
    /// Returns an error if CUDA device initialization fails
    pub fn new(ordinal: usize) -> Result<Self> {
        // A non-default stream keeps engine work off the legacy stream.
        let device = CudaDevice::new_with_stream(ordinal)?;
        tracing::debug!(ordinal, name = ?device.name().ok(), "CUDA context created");
        Ok(Self {
            buffer_pool: BufferPool::new(&device),
            device,
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    #[must_use]
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.device.ordinal()
    }

    /// Wait for all queued work on the device stream.
    ///
    /// # Errors
    /// Returns an error if synchronization fails
    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}
