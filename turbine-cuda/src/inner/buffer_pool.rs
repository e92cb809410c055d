//! Device staging-buffer pool
//!
//! The engine allocates its comm buffers once per configuration and frees
//! them on shutdown; a rebuilt engine on the same context reuses them
//! instead of calling `cuMemAlloc` again. Buffers are keyed by byte size,
//! so one size class serves every dtype and shape with the same footprint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cudarc::driver::{CudaDevice, CudaSlice, DeviceSlice};

use turbine::{Error, Result};

/// A pool of reusable device byte buffers.
///
/// Interior-mutable so it can be shared between clones of a
/// [`CudaContext`](super::CudaContext).
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

struct PoolInner {
    /// Free buffers indexed by byte size. Each entry is a LIFO stack.
    free: HashMap<usize, Vec<CudaSlice<u8>>>,
    free_bytes: usize,
    device: Arc<CudaDevice>,
    hits: u64,
    misses: u64,
}

impl BufferPool {
    #[must_use]
    pub fn new(device: &Arc<CudaDevice>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free: HashMap::new(),
                free_bytes: 0,
                device: Arc::clone(device),
                hits: 0,
                misses: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a zero-filled buffer of `byte_size` bytes, reusing a cached one
    /// when available.
    ///
    /// # Errors
    /// Returns [`Error::OutOfMemory`] if a fresh allocation fails, or the
    /// driver error if the zero fill does.
    pub fn acquire(&self, byte_size: usize) -> Result<CudaSlice<u8>> {
        let mut pool = self.lock();
        if let Some(mut buf) = pool.free.get_mut(&byte_size).and_then(Vec::pop) {
            pool.free_bytes -= byte_size;
            pool.hits += 1;
            pool.device.memset_zeros(&mut buf)?;
            return Ok(buf);
        }
        pool.misses += 1;
        pool.device.alloc_zeros::<u8>(byte_size.max(1)).map_err(|e| {
            tracing::error!(byte_size, error = %e, "comm buffer allocation failed");
            Error::OutOfMemory {
                requested: byte_size,
            }
        })
    }

    /// Return a buffer to the pool for future reuse.
    pub fn release(&self, buf: CudaSlice<u8>, byte_size: usize) {
        debug_assert!(buf.len() >= byte_size);
        let mut pool = self.lock();
        pool.free_bytes += byte_size;
        pool.free.entry(byte_size).or_default().push(buf);
    }

    /// Number of cache hits (buffer reused from pool).
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.lock().hits
    }

    /// Number of cache misses (fresh allocation required).
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.lock().misses
    }

    /// Total bytes currently held (free) in the pool.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.lock().free_bytes
    }

    /// Free every cached buffer.
    pub fn clear(&self) {
        let mut pool = self.lock();
        pool.free.clear();
        pool.free_bytes = 0;
    }
}
