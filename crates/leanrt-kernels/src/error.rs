//! Error types for the kernel layer.

use thiserror::Error;

use crate::DataType;

/// Errors that can occur while checking or launching a kernel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    /// The op does not accept this element type.
    #[error("{op} does not support data type {dtype}")]
    UnsupportedDataType { op: &'static str, dtype: DataType },

    /// Wrong number of operands for the op.
    #[error("{op} expects {expected} inputs, got {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Operand shapes cannot be combined.
    #[error("shape mismatch in {op}: {reason}")]
    ShapeMismatch { op: &'static str, reason: String },

    /// Operand element types differ.
    #[error("{op} operands have mixed data types ({left} and {right})")]
    MixedDataTypes {
        op: &'static str,
        left: DataType,
        right: DataType,
    },

    /// Kernel execution failed.
    #[error("kernel execution failed: {0}")]
    Execution(String),
}
