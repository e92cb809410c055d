//! Turbine runtime: the continuous-batching scheduler
//!
//! This crate drives a [`turbine`] backend through the request lifecycle:
//! requests are pulled from a [`Gateway`](turbine::Gateway), validated,
//! placed in batch slots, admitted under a per-iteration token budget, run
//! through the model and the sampler, and completed through signals handed
//! back to the gateway.
//!
//! # Architecture
//!
//! ```text
//! Engine<B>                      ← owns batch state and device buffers
//!   ├── TripleBuffer<B>          ← active / back / incoming slot arrays
//!   ├── dyn ModelForward<B>      ← forward pass
//!   ├── dyn DynamicDecode<B>     ← sampler
//!   ├── dyn SequenceManager      ← cache blocks and session history
//!   └── dyn Gateway              ← request queue and output thread
//! ```

pub mod admission;
pub mod batch_state;
mod engine;
pub mod gateway;
pub mod generation;
pub mod release;
pub mod sequence_manager;

use turbine::backend::{Backend, CommBufferOps, IndexedCopyOps, LayoutOps, PenaltyOps};

pub use batch_state::{BatchState, TripleBuffer};
pub use engine::{Engine, EngineHandle};
pub use gateway::{ChannelGateway, Submission};
pub use generation::GenerationState;
pub use sequence_manager::{BlockPoolConfig, BlockSequenceManager};

/// Every op the engine needs from a backend.
pub trait EngineBackend:
    Backend + PenaltyOps + IndexedCopyOps + LayoutOps + CommBufferOps
{
}

impl<T> EngineBackend for T where
    T: Backend + PenaltyOps + IndexedCopyOps + LayoutOps + CommBufferOps
{
}
