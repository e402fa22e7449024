//! Core library for leanrt, a lean inference-engine runtime.
//!
//! This crate provides:
//! - Engine deserialization from the `LRTE` blob format
//! - Engines exposing IO tensor metadata and optimization profiles
//! - Execution contexts binding caller memory to tensors by name
//! - Asynchronous, stream-ordered launches with events
//! - A replaceable logger callback and optional error recorders

pub mod blob;
pub mod config;
pub mod context;
pub mod dims;
pub mod engine;
pub mod error;
pub mod logger;
pub mod memory;
pub mod recorder;
pub mod runtime;
pub mod stream;

mod plan;

pub use blob::{EngineBlob, EngineManifest, TensorKind, TensorLocation};
pub use config::RuntimeConfig;
pub use context::{AllocationStrategy, ContextState, ExecutionContext};
pub use dims::{Dims, MAX_DIMS};
pub use engine::{Engine, ProfileSelector, TensorIoMode};
pub use error::{BindingError, BlobError, LeanError, Result, StreamError};
pub use logger::{LogCallback, Logger, Severity};
pub use memory::{AlignedBuffer, TENSOR_ALIGNMENT};
pub use recorder::{ErrorCode, ErrorLog, ErrorRecorder};
pub use runtime::Runtime;
pub use stream::{Event, Stream};

/// Re-export kernel types.
pub use leanrt_kernels::{CpuBackend, DataType, KernelBackend, OpKind, byte_size};
