//! Kernel abstraction layer for leanrt.
//!
//! This crate provides the pieces of an engine that actually touch tensor
//! data:
//! - the element types and raw tensor views handed to kernels
//! - the op set an engine plan is made of, with shape inference
//! - the `KernelBackend` trait and the reference `CpuBackend` (ndarray)

mod backend;
mod error;
mod op;
mod tensor;

pub use backend::KernelBackend;
pub use error::KernelError;
pub use op::{OpKind, WILDCARD, broadcast_dims, infer_output_dims};
pub use tensor::{DataType, TensorView, TensorViewMut, byte_size, element_count};

#[cfg(feature = "cpu")]
pub use backend::cpu::CpuBackend;

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;
