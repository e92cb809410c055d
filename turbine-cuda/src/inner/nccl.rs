//! NCCL communicator for tensor-parallel ranks
//!
//! The engine only ever broadcasts: rank 0 decides the batch and the other
//! ranks receive it through the comm buffers.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice};
use cudarc::nccl::safe::{Comm, Id};

use turbine::{Error, Result};

use super::CudaTensor;

/// One rank's handle on an NCCL group.
///
/// Every rank of the group must enter each collective together.
pub struct NcclCommunicator {
    comm: Comm,
}

// SAFETY: each rank thread owns its communicator; the raw `*mut ncclComm`
// blocks the auto-derive but the handle may move between threads.
unsafe impl Send for NcclCommunicator {}

// SAFETY: all methods take `&self` and the engine drives collectives from a
// single thread per rank.
unsafe impl Sync for NcclCommunicator {}

impl NcclCommunicator {
    /// One communicator per device on a single node, ordered by ordinal.
    ///
    /// # Errors
    /// Returns an error if NCCL initialization fails.
    pub fn from_devices(devices: Vec<Arc<CudaDevice>>) -> Result<Vec<Self>> {
        let comms = Comm::from_devices(devices)?;
        Ok(comms.into_iter().map(|comm| Self { comm }).collect())
    }

    /// Join a group as `rank`; rank 0 creates the [`NcclId`] and shares it.
    ///
    /// # Errors
    /// Returns an error if NCCL initialization fails.
    pub fn from_rank(
        device: Arc<CudaDevice>,
        rank: usize,
        world_size: usize,
        id: NcclId,
    ) -> Result<Self> {
        let comm = Comm::from_rank(device, rank, world_size, id.0)?;
        Ok(Self { comm })
    }

    /// The device this communicator's collectives run on.
    #[must_use]
    pub fn device(&self) -> Arc<CudaDevice> {
        self.comm.device()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Overwrite `tensor` on every rank with its contents on `root`.
    ///
    /// Asynchronous on the device stream.
    ///
    /// # Errors
    /// Returns an error for an out-of-range root or a failed collective.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn broadcast(&self, tensor: &mut CudaTensor, root: usize) -> Result<()> {
        if root >= self.world_size() {
            return Err(Error::Other(format!(
                "broadcast root {root} out of range for {} ranks",
                self.world_size()
            )));
        }
        let send: Option<CudaSlice<u8>> = if self.rank() == root {
            Some(tensor.bytes().clone())
        } else {
            None
        };
        self.comm.broadcast(&send, tensor.bytes_mut(), root as i32)?;
        Ok(())
    }
}

/// Opaque NCCL unique id; rank 0 generates it and ships the raw bytes.
#[derive(Debug, Clone, Copy)]
pub struct NcclId(Id);

impl NcclId {
    /// # Errors
    /// Returns an error if NCCL id generation fails.
    pub fn new() -> Result<Self> {
        Ok(Self(Id::new()?))
    }

    #[must_use]
    pub fn from_raw(internal: [core::ffi::c_char; 128]) -> Self {
        Self(Id::uninit(internal))
    }

    #[must_use]
    pub fn to_raw(&self) -> &[core::ffi::c_char; 128] {
        self.0.internal()
    }
}
