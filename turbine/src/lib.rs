//! Turbine: the decode-time core of a continuous-batching inference engine
//!
//! This crate provides the core types and traits shared by the scheduler
//! and the backends: tensors and dtypes, the backend op traits (penalty
//! kernels, indexed copy, layout, comm buffers), requests and signals, and
//! the collaborator boundaries (sequence manager, model forward, dynamic
//! decode, gateway). Backend implementations live in separate crates.

#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod backend;
pub mod config;
pub mod dtype;
pub mod error;
pub mod gateway;
pub mod model;
pub mod penalty;
pub mod request;
pub mod sampling;
pub mod sequence;
pub mod signal;
pub mod tensor;
pub mod tensor_map;

pub use backend::{
    validate_indexed_copy, Backend, CommBufferOps, CopyPair, IndexedCopyOps, LayoutOps,
    PenaltyOps,
};
pub use config::EngineConfig;
pub use dtype::{DType, LogitDType, TensorDType};
pub use error::{Error, Result};
pub use gateway::{Gateway, PendingRequests};
pub use model::{DecodeStep, DynamicDecode, ModelForward, SlotSampling};
pub use penalty::{InvalidTokenPolicy, RepetitionMode, RepetitionParams, Temperature};
pub use request::{
    CancelToken, FinishReason, GenerationEvent, Request, RequestId, RequestStatus, SessionParam,
    StatusKind, TokenSender,
};
pub use sampling::{GenerationConfig, OutputLogits, MAX_END_IDS, MAX_STOP_BAD_WORDS_LEN};
pub use sequence::{Sequence, SequenceId, SequenceManager, SequenceStatus};
pub use signal::Signal;
pub use tensor::Tensor;
pub use tensor_map::TensorMap;
