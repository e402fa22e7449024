//! Error types for the leanrt-core library.
//!
//! The runtime surface reports checked failures as values (`bool`, `Option`,
//! sentinel dims) and sends the matching error through the `Logger`; these
//! types are what the internal code propagates with `?` before that
//! conversion happens.

use thiserror::Error;

use crate::context::AllocationStrategy;

/// Main error type for the leanrt library.
#[derive(Error, Debug)]
pub enum LeanError {
    /// Engine blob could not be decoded or validated.
    #[error("engine blob error: {0}")]
    Blob(#[from] BlobError),

    /// Tensor binding or launch validation failed.
    #[error("binding error: {0}")]
    Binding(#[from] BindingError),

    /// Stream submission or execution failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Error from the kernel layer.
    #[error("kernel error: {0}")]
    Kernel(#[from] leanrt_kernels::KernelError),

    /// Engine-owned memory could not be allocated.
    #[error("failed to allocate {0} bytes")]
    Allocation(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors related to decoding and validating an engine blob.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlobError {
    /// Blob is smaller than the fixed header.
    #[error("blob is {0} bytes, smaller than the engine header")]
    TooShort(usize),

    /// Blob exceeds the configured size limit.
    #[error("blob is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    /// Magic bytes do not identify an engine blob.
    #[error("invalid engine magic")]
    BadMagic,

    /// Blob was written by an incompatible format version.
    #[error("unsupported engine format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Header payload length does not match the blob size.
    #[error("payload length mismatch: header says {declared} bytes, blob holds {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    /// Payload checksum does not match the header.
    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Payload ended in the middle of a record.
    #[error("truncated payload: need {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// Payload has bytes left after the last record.
    #[error("{0} unexpected trailing bytes after the op list")]
    TrailingBytes(usize),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 string at offset {0}")]
    InvalidString(usize),

    /// A tensor record is malformed or inconsistent.
    #[error("invalid tensor '{name}': {reason}")]
    InvalidTensor { name: String, reason: String },

    /// An optimization profile is malformed.
    #[error("invalid optimization profile {index}: {reason}")]
    InvalidProfile { index: usize, reason: String },

    /// An op record is malformed or cannot run.
    #[error("invalid op {index}: {reason}")]
    InvalidOp { index: usize, reason: String },

    /// A manifest could not be turned into a blob.
    #[error("invalid manifest: {0}")]
    Manifest(String),
}

/// Errors related to tensor binding and launch validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindingError {
    /// Name is not an IO tensor of the engine.
    #[error("'{0}' is not an input or output tensor of the engine")]
    UnknownTensor(String),

    /// Operation only applies to input tensors.
    #[error("'{0}' is not an input tensor")]
    NotAnInput(String),

    /// Tensor has no bound address.
    #[error("tensor '{0}' has no bound address")]
    MissingAddress(String),

    /// Input shape still has wildcard dimensions.
    #[error("input '{0}' has unresolved dimensions; call set_input_shape first")]
    UnresolvedShape(String),

    /// Requested input shape is not allowed.
    #[error("invalid shape for '{name}': {reason}")]
    InvalidShape { name: String, reason: String },

    /// Optimization profile index is out of range.
    #[error("optimization profile {index} out of range (engine has {count})")]
    ProfileOutOfRange { index: usize, count: usize },

    /// User-managed context launched without activation memory.
    #[error("no device memory set for a user-managed execution context")]
    MissingDeviceMemory,

    /// Activation memory is smaller than the launch needs.
    #[error("device memory of {size} bytes is smaller than the required {required} bytes")]
    DeviceMemoryTooSmall { size: usize, required: usize },

    /// Operation is not valid for the context's allocation strategy.
    #[error("operation not supported with the {0} allocation strategy")]
    WrongStrategy(AllocationStrategy),

    /// Activation memory could not be allocated.
    #[error("failed to allocate {0} bytes of activation memory")]
    Allocation(usize),

    /// A tensor's byte size does not fit in the address space.
    #[error("size of '{0}' overflows the address space")]
    SizeOverflow(String),

    /// Shapes resolved for the launch are inconsistent.
    #[error("shape inference failed: {0}")]
    ShapeInference(String),
}

/// Errors related to streams.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// The worker thread could not be started.
    #[error("failed to start stream worker: {0}")]
    Spawn(String),

    /// The stream no longer accepts work.
    #[error("stream is closed")]
    Closed,

    /// Work previously submitted to the stream failed.
    #[error("launch failed: {0}")]
    LaunchFailed(String),
}

/// Result type for the leanrt library.
pub type Result<T> = std::result::Result<T, LeanError>;
