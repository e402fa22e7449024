//! Tensor element types and raw views handed to kernels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported tensor element types.
///
/// The discriminants are the codes stored in engine blobs and exposed
/// through the C surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum DataType {
    Float = 0,
    Half = 1,
    Int8 = 2,
    Int32 = 3,
    Bool = 4,
    Uint8 = 5,
    Fp8 = 6,
    Bf16 = 7,
    Int64 = 8,
    Int4 = 9,
}

impl DataType {
    /// Look up a data type by its blob code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => DataType::Float,
            1 => DataType::Half,
            2 => DataType::Int8,
            3 => DataType::Int32,
            4 => DataType::Bool,
            5 => DataType::Uint8,
            6 => DataType::Fp8,
            7 => DataType::Bf16,
            8 => DataType::Int64,
            9 => DataType::Int4,
            _ => return None,
        })
    }

    /// Blob code of this data type.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Width of one element in bits.
    pub fn size_bits(self) -> usize {
        match self {
            DataType::Int4 => 4,
            DataType::Int8 | DataType::Bool | DataType::Uint8 | DataType::Fp8 => 8,
            DataType::Half | DataType::Bf16 => 16,
            DataType::Float | DataType::Int32 => 32,
            DataType::Int64 => 64,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float => "float",
            DataType::Half => "half",
            DataType::Int8 => "int8",
            DataType::Int32 => "int32",
            DataType::Bool => "bool",
            DataType::Uint8 => "uint8",
            DataType::Fp8 => "fp8",
            DataType::Bf16 => "bf16",
            DataType::Int64 => "int64",
            DataType::Int4 => "int4",
        };
        f.write_str(name)
    }
}

/// Number of bytes needed to hold `volume` elements of `dtype`, or `None`
/// if that does not fit in `usize`.
///
/// Sub-byte types are packed and rounded up to a whole byte.
pub fn byte_size(dtype: DataType, volume: usize) -> Option<usize> {
    volume
        .checked_mul(dtype.size_bits())
        .map(|bits| bits.div_ceil(8))
}

/// Number of elements of a tensor with `dims`, or `None` on overflow.
pub fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Read-only view of a tensor living at a caller-owned address.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub dtype: DataType,
    pub dims: &'a [usize],
    pub data: *const u8,
}

impl TensorView<'_> {
    /// Number of elements.
    pub fn volume(&self) -> Option<usize> {
        element_count(self.dims)
    }

    /// Size of the viewed data in bytes.
    pub fn byte_len(&self) -> Option<usize> {
        self.volume().and_then(|v| byte_size(self.dtype, v))
    }
}

/// Writable view of a tensor living at a caller-owned address.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    pub dtype: DataType,
    pub dims: &'a [usize],
    pub data: *mut u8,
}

impl TensorViewMut<'_> {
    /// Number of elements.
    pub fn volume(&self) -> Option<usize> {
        element_count(self.dims)
    }

    /// Size of the viewed data in bytes.
    pub fn byte_len(&self) -> Option<usize> {
        self.volume().and_then(|v| byte_size(self.dtype, v))
    }
}
