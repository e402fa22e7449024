//! Subcommands and the engine helpers they share.

pub mod bench;
pub mod config;
pub mod inspect;
pub mod pack;
pub mod run;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use serde_json::Value;
use tracing::debug;

use leanrt_core::{
    AlignedBuffer, DataType, Dims, Engine, ExecutionContext, Logger, ProfileSelector, Runtime,
    RuntimeConfig, TensorIoMode, byte_size,
};

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("leanrt")
        .join("config.json")
}

/// Load the configuration from `path`, the default file, or the defaults.
pub fn load_config(path: Option<&str>) -> anyhow::Result<RuntimeConfig> {
    if let Some(path) = path {
        return Ok(RuntimeConfig::from_file(Path::new(path))?);
    }
    let default_path = default_config_path();
    if default_path.exists() {
        debug!("Using config file {}", default_path.display());
        Ok(RuntimeConfig::from_file(&default_path)?)
    } else {
        Ok(RuntimeConfig::default())
    }
}

/// An engine together with the runtime that deserialized it.
pub struct LoadedEngine {
    pub engine: Engine,
    // Dropped after the engine.
    _runtime: Runtime,
}

/// Deserialize the engine stored at `path`.
///
/// Runtime diagnostics are forwarded to `tracing` from
/// `logging.min_severity` upwards.
pub fn load_engine(path: &Path, config: RuntimeConfig) -> anyhow::Result<LoadedEngine> {
    if !path.exists() {
        bail!("Engine file not found: {}", path.display());
    }
    let blob = fs::read(path)?;

    let logger = Arc::new(Logger::tracing(config.logging.min_severity));
    let runtime = Runtime::with_config(logger, config);
    let engine = runtime
        .try_deserialize_engine(&blob)
        .map_err(|e| anyhow!("Failed to load engine {}: {}", path.display(), e))?;

    Ok(LoadedEngine {
        engine,
        _runtime: runtime,
    })
}

/// Parse `name=value` pairs.
pub fn parse_assignment(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", arg)),
    }
}

/// Parse `name=DxDxD` shape assignments, e.g. `tokens=8x4`.
pub fn parse_shape(arg: &str) -> Result<(String, Vec<i64>), String> {
    let (name, dims) = parse_assignment(arg)?;
    if dims.is_empty() {
        return Ok((name, Vec::new()));
    }
    let dims = dims
        .split('x')
        .map(|d| d.trim().parse::<i64>().map_err(|e| format!("invalid dimension '{}': {}", d, e)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name, dims))
}

/// Host buffer bound to one IO tensor.
pub struct IoTensor {
    pub name: String,
    pub mode: TensorIoMode,
    pub dtype: DataType,
    pub dims: Vec<i64>,
    pub buffer: AlignedBuffer,
}

/// Set input shapes, then allocate and bind a buffer for every IO tensor.
///
/// Inputs without an explicit shape use their engine shape, with wildcards
/// taken from the `opt` shape of the selected profile. Inputs listed in
/// `data` are initialized from it; everything else starts zeroed.
pub fn bind_io(
    engine: &Engine,
    context: &mut ExecutionContext,
    shapes: &HashMap<String, Vec<i64>>,
    data: &HashMap<String, Vec<u8>>,
) -> anyhow::Result<Vec<IoTensor>> {
    for name in shapes.keys().chain(data.keys()) {
        if engine.tensor_io_mode(name) != TensorIoMode::Input {
            bail!("'{}' is not an input of engine '{}'", name, engine.name());
        }
    }

    let names: Vec<String> = (0..engine.nb_io_tensors())
        .filter_map(|i| engine.io_tensor_name(i))
        .map(str::to_string)
        .collect();

    for name in &names {
        if engine.tensor_io_mode(name) != TensorIoMode::Input {
            continue;
        }
        let declared = engine.tensor_shape(name);
        let dims = match shapes.get(name) {
            Some(dims) => Dims::new(dims).ok_or_else(|| anyhow!("shape of '{}' has too many dimensions", name))?,
            None if declared.has_wildcards() => {
                engine.profile_shape(name, context.optimization_profile(), ProfileSelector::Opt)
            }
            None => continue,
        };
        if !context.set_input_shape(name, &dims) {
            bail!("Shape {} is not valid for input '{}'", dims, name);
        }
    }

    let mut tensors = Vec::with_capacity(names.len());
    for name in names {
        let mode = engine.tensor_io_mode(&name);
        let dtype = engine
            .tensor_data_type(&name)
            .ok_or_else(|| anyhow!("no data type for '{}'", name))?;
        let shape = context.tensor_shape(&name);
        let volume = shape
            .volume()
            .ok_or_else(|| anyhow!("shape of '{}' is not resolved: {}", name, shape))?;
        let size = byte_size(dtype, volume)
            .ok_or_else(|| anyhow!("size of '{}' with shape {} overflows", name, shape))?;

        let mut buffer = match data.get(&name) {
            Some(bytes) if bytes.len() != size => {
                bail!("Input '{}' needs {} bytes, got {}", name, size, bytes.len());
            }
            Some(bytes) => AlignedBuffer::from_bytes(bytes),
            None => AlignedBuffer::new(size),
        }
        .ok_or_else(|| anyhow!("failed to allocate {} bytes for '{}'", size, name))?;

        context.set_tensor_address(&name, buffer.as_void_ptr());
        debug!("Bound {} bytes to '{}' with shape {}", size, name, shape);

        tensors.push(IoTensor {
            name,
            mode,
            dtype,
            dims: shape.as_slice().to_vec(),
            buffer,
        });
    }
    Ok(tensors)
}

/// Decode tensor bytes into JSON numbers. Unsupported types give `null`.
pub fn tensor_values(dtype: DataType, bytes: &[u8]) -> Value {
    fn decode<const N: usize, T: Into<Value>>(bytes: &[u8], f: fn([u8; N]) -> T) -> Value {
        Value::Array(
            bytes
                .chunks_exact(N)
                .filter_map(|chunk| <[u8; N]>::try_from(chunk).ok())
                .map(|chunk| f(chunk).into())
                .collect(),
        )
    }

    match dtype {
        DataType::Float => decode(bytes, f32::from_ne_bytes),
        DataType::Int32 => decode(bytes, i32::from_ne_bytes),
        DataType::Int64 => decode(bytes, i64::from_ne_bytes),
        DataType::Int8 => decode(bytes, i8::from_ne_bytes),
        DataType::Uint8 => decode(bytes, u8::from_ne_bytes),
        DataType::Bool => decode(bytes, |[b]: [u8; 1]| b != 0),
        _ => Value::Null,
    }
}

/// Name of an IO mode as shown to users.
pub fn io_mode_name(mode: TensorIoMode) -> &'static str {
    match mode {
        TensorIoMode::Input => "input",
        TensorIoMode::Output => "output",
        TensorIoMode::None => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shape() {
        assert_eq!(parse_shape("tokens=8x4").unwrap(), ("tokens".to_string(), vec![8, 4]));
        assert_eq!(parse_shape("scalar=").unwrap(), ("scalar".to_string(), vec![]));
        assert!(parse_shape("tokens").is_err());
        assert!(parse_shape("=3").is_err());
        assert!(parse_shape("tokens=8xfour").is_err());
    }

    #[test]
    fn test_tensor_values() {
        let bytes: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(tensor_values(DataType::Float, &bytes), serde_json::json!([1.5, -2.0]));
        assert_eq!(tensor_values(DataType::Bool, &[0, 1]), serde_json::json!([false, true]));
        assert_eq!(tensor_values(DataType::Half, &[0, 0]), Value::Null);
    }
}
