//! JSON description of an engine, compiled into a blob by `leanrt pack`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use leanrt_kernels::{DataType, OpKind};

use super::{EngineBlob, OpRecord, ProfileEntry, ProfileRecord, TensorKind, TensorLocation, TensorRecord};
use crate::error::{BlobError, LeanError, Result};

/// Human-editable engine description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineManifest {
    #[serde(default)]
    pub name: String,
    pub tensors: Vec<ManifestTensor>,
    /// One map per optimization profile, keyed by input name.
    #[serde(default)]
    pub profiles: Vec<BTreeMap<String, ManifestRange>>,
    pub ops: Vec<ManifestOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestTensor {
    pub name: String,
    pub kind: TensorKind,
    #[serde(default = "default_dtype")]
    pub dtype: DataType,
    #[serde(default)]
    pub location: TensorLocation,
    pub dims: Vec<i64>,
    /// Constant values, converted to `dtype` when packing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRange {
    pub min: Vec<i64>,
    pub opt: Vec<i64>,
    pub max: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestOp {
    #[serde(flatten)]
    pub op: OpKind,
    pub inputs: Vec<String>,
    pub output: String,
}

fn default_dtype() -> DataType {
    DataType::Float
}

impl EngineManifest {
    /// Parse a manifest from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BlobError::Manifest(e.to_string()).into())
    }

    /// Load a manifest from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Resolve tensor names and encode constant values.
    ///
    /// Only name resolution happens here; whether the engine can run is
    /// decided when the blob is deserialized.
    pub fn into_blob(self) -> Result<EngineBlob> {
        let mut tensors = Vec::with_capacity(self.tensors.len());
        for tensor in self.tensors {
            let data = encode_values(&tensor)?;
            tensors.push(TensorRecord {
                name: tensor.name,
                kind: tensor.kind,
                dtype: tensor.dtype,
                location: tensor.location,
                dims: tensor.dims,
                data,
            });
        }

        let blob = EngineBlob {
            name: self.name,
            tensors,
            profiles: Vec::new(),
            ops: Vec::new(),
        };
        let lookup = |name: &str| {
            blob.tensor_index(name)
                .ok_or_else(|| LeanError::from(BlobError::Manifest(format!("unknown tensor '{}'", name))))
        };

        let mut profiles = Vec::with_capacity(self.profiles.len());
        for ranges in &self.profiles {
            let mut entries = Vec::with_capacity(ranges.len());
            for (name, range) in ranges {
                entries.push(ProfileEntry {
                    tensor: lookup(name)?,
                    min: range.min.clone(),
                    opt: range.opt.clone(),
                    max: range.max.clone(),
                });
            }
            profiles.push(ProfileRecord { entries });
        }

        let mut ops = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            ops.push(OpRecord {
                op: op.op,
                inputs: op.inputs.iter().map(|name| lookup(name)).collect::<Result<_>>()?,
                output: lookup(&op.output)?,
            });
        }

        Ok(EngineBlob {
            profiles,
            ops,
            ..blob
        })
    }
}

fn encode_values(tensor: &ManifestTensor) -> Result<Vec<u8>> {
    if tensor.values.is_empty() {
        return Ok(Vec::new());
    }
    if tensor.kind != TensorKind::Constant {
        return Err(BlobError::Manifest(format!(
            "tensor '{}' has values but is not a constant",
            tensor.name
        ))
        .into());
    }

    let values = tensor.values.iter().copied();
    let bytes = match tensor.dtype {
        DataType::Float => values.flat_map(|v| (v as f32).to_le_bytes()).collect(),
        DataType::Int32 => values.flat_map(|v| (v as i32).to_le_bytes()).collect(),
        DataType::Int64 => values.flat_map(|v| (v as i64).to_le_bytes()).collect(),
        DataType::Int8 => values.map(|v| v as i8 as u8).collect(),
        DataType::Uint8 => values.map(|v| v as u8).collect(),
        DataType::Bool => values.map(|v| u8::from(v != 0.0)).collect(),
        other => {
            return Err(BlobError::Manifest(format!(
                "cannot encode values for '{}' as {}",
                tensor.name, other
            ))
            .into());
        }
    };
    Ok(bytes)
}
