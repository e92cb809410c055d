//! Host staging-buffer pool.
//!
//! Comm buffers are allocated and freed every time the batch composition
//! changes, so freed storage is cached and reused for the next allocation of
//! the same size. Storage is keyed by word count, so one size class serves
//! every dtype and shape with the same footprint.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// A pool of reusable host buffers.
///
/// Interior-mutable so it can be shared between clones of the backend.
#[derive(Clone, Default)]
pub struct HostBufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

#[derive(Default)]
struct PoolInner {
    /// Free storage indexed by word count. Each entry is a LIFO stack.
    free: HashMap<usize, Vec<Vec<u64>>>,
    free_bytes: usize,
    hits: u64,
    misses: u64,
}

impl HostBufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A panic while holding the lock cannot leave the maps inconsistent.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Take a cached buffer of exactly `words` words, zero-filled.
    ///
    /// Returns `None` when the caller must allocate.
    #[must_use]
    pub fn acquire(&self, words: usize) -> Option<Vec<u64>> {
        let mut pool = self.lock();
        if let Some(mut buf) = pool.free.get_mut(&words).and_then(Vec::pop) {
            pool.free_bytes -= words * 8;
            pool.hits += 1;
            buf.fill(0);
            return Some(buf);
        }
        pool.misses += 1;
        None
    }

    /// Return storage to the pool for reuse.
    pub fn release(&self, buf: Vec<u64>) {
        let words = buf.len();
        let mut pool = self.lock();
        pool.free_bytes += words * 8;
        pool.free.entry(words).or_default().push(buf);
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

    /// Number of distinct buffer sizes tracked.
    #[must_use]
    pub fn num_size_classes(&self) -> usize {
        self.lock().free.len()
    }

    pub fn clear(&self) {
        let mut pool = self.lock();
        pool.free.clear();
        pool.free_bytes = 0;
    }
}
