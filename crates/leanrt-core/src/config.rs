//! Configuration structures for the runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::AllocationStrategy;
use crate::logger::Severity;

/// Main configuration for a leanrt runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Engine deserialization configuration.
    pub engine: EngineConfig,

    /// Execution context configuration.
    pub context: ContextConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Engine deserialization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest blob accepted by `deserialize_engine`, in bytes.
    pub max_blob_size: u64,

    /// Verify the payload checksum when deserializing.
    pub verify_checksum: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_blob_size: 2 * 1024 * 1024 * 1024,
            verify_checksum: true,
        }
    }
}

/// Execution context configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Strategy used by `create_default_execution_context`.
    pub default_strategy: AllocationStrategy,

    /// Log a warning when a bound address is not 256-byte aligned.
    pub warn_on_misaligned: bool,

    /// Log a one-time warning when a context enqueues on the default stream.
    pub warn_on_default_stream: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_strategy: AllocationStrategy::Static,
            warn_on_misaligned: true,
            warn_on_default_stream: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Least severe message forwarded by `Logger::tracing`.
    pub min_severity: Severity,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            min_severity: Severity::Warning,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)
    }
}
