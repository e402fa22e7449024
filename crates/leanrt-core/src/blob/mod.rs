//! Serialized engine format.
//!
//! Layout (little endian):
//!
//! ```text
//! magic "LRTE" | version u32 | flags u32 | payload_len u64 | checksum u32 | payload
//! ```
//!
//! The payload holds the engine name, the tensor table, the optimization
//! profiles and the op list. The runtime treats the blob as opaque input:
//! this module only decodes it; `Engine` construction validates that the
//! decoded records describe a runnable engine.

mod manifest;
mod reader;
mod writer;

pub use manifest::{EngineManifest, ManifestOp, ManifestRange, ManifestTensor};

use serde::{Deserialize, Serialize};

use leanrt_kernels::{DataType, OpKind};

use crate::error::BlobError;

/// Magic bytes at the start of every engine blob.
pub const BLOB_MAGIC: &[u8; 4] = b"LRTE";

/// Format version written by this crate.
pub const BLOB_VERSION: u32 = 1;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 24;

/// Longest tensor name in bytes, excluding a C terminator.
pub const MAX_NAME_LEN: usize = 4095;

/// Role of a tensor in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorKind {
    Input,
    Output,
    /// Intermediate value produced and consumed inside the engine.
    Activation,
    /// Weights stored in the blob.
    Constant,
}

impl TensorKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            TensorKind::Input => 0,
            TensorKind::Output => 1,
            TensorKind::Activation => 2,
            TensorKind::Constant => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => TensorKind::Input,
            1 => TensorKind::Output,
            2 => TensorKind::Activation,
            3 => TensorKind::Constant,
            _ => return None,
        })
    }
}

/// Where the memory bound to a tensor must live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum TensorLocation {
    #[default]
    Device = 0,
    Host = 1,
}

impl TensorLocation {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TensorLocation::Device),
            1 => Some(TensorLocation::Host),
            _ => None,
        }
    }
}

/// One entry of the tensor table.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub name: String,
    pub kind: TensorKind,
    pub dtype: DataType,
    pub location: TensorLocation,
    pub dims: Vec<i64>,
    /// Little-endian element data, constants only.
    pub data: Vec<u8>,
}

/// Shape range of one input within an optimization profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub tensor: u32,
    pub min: Vec<i64>,
    pub opt: Vec<i64>,
    pub max: Vec<i64>,
}

/// One optimization profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileRecord {
    pub entries: Vec<ProfileEntry>,
}

/// One step of the plan. Operands are tensor table indices.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    pub op: OpKind,
    pub inputs: Vec<u32>,
    pub output: u32,
}

/// Decoded engine blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineBlob {
    pub name: String,
    pub tensors: Vec<TensorRecord>,
    pub profiles: Vec<ProfileRecord>,
    pub ops: Vec<OpRecord>,
}

/// Limits applied while decoding.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    pub max_size: u64,
    pub verify_checksum: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_size: u64::MAX,
            verify_checksum: true,
        }
    }
}

impl EngineBlob {
    /// Decode a blob.
    pub fn from_bytes(bytes: &[u8], options: &DecodeOptions) -> Result<Self, BlobError> {
        reader::decode(bytes, options)
    }

    /// Encode this blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        writer::encode(self)
    }

    /// Index of the tensor called `name`.
    pub fn tensor_index(&self, name: &str) -> Option<u32> {
        self.tensors
            .iter()
            .position(|t| t.name == name)
            .map(|i| i as u32)
    }
}

/// FNV-1a checksum of the payload.
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn sample_blob() -> EngineBlob {
        EngineBlob {
            name: "sample".to_string(),
            tensors: vec![
                TensorRecord {
                    name: "x".to_string(),
                    kind: TensorKind::Input,
                    dtype: DataType::Float,
                    location: TensorLocation::Device,
                    dims: vec![-1, 2],
                    data: Vec::new(),
                },
                TensorRecord {
                    name: "w".to_string(),
                    kind: TensorKind::Constant,
                    dtype: DataType::Float,
                    location: TensorLocation::Device,
                    dims: vec![2],
                    data: [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect(),
                },
                TensorRecord {
                    name: "y".to_string(),
                    kind: TensorKind::Output,
                    dtype: DataType::Float,
                    location: TensorLocation::Host,
                    dims: vec![-1, 2],
                    data: Vec::new(),
                },
            ],
            profiles: vec![ProfileRecord {
                entries: vec![ProfileEntry {
                    tensor: 0,
                    min: vec![1, 2],
                    opt: vec![2, 2],
                    max: vec![4, 2],
                }],
            }],
            ops: vec![OpRecord {
                op: OpKind::Mul,
                inputs: vec![0, 1],
                output: 2,
            }],
        }
    }

    #[test]
    fn test_encode_decode_preserves_records() {
        let blob = sample_blob();
        let bytes = blob.to_bytes();
        assert_eq!(&bytes[..4], BLOB_MAGIC);

        let decoded = EngineBlob::from_bytes(&bytes, &DecodeOptions::default()).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(checksum(b""), 0x811c_9dc5);
        assert_eq!(checksum(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_tensor_index() {
        let blob = sample_blob();
        assert_eq!(blob.tensor_index("y"), Some(2));
        assert_eq!(blob.tensor_index("z"), None);
    }
}
