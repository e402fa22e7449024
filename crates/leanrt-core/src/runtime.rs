//! Runtime: the factory deserializing engine blobs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use leanrt_kernels::{CpuBackend, KernelBackend};

use crate::config::RuntimeConfig;
use crate::engine::{Engine, EngineParts};
use crate::error::Result;
use crate::logger::{Logger, Severity};
use crate::recorder::{ErrorCode, ErrorRecorder, Reporter};

/// Deserializes engines and wires them to a logger.
///
/// The logger, configuration, kernel backend and error recorder of the
/// runtime are handed to every engine it creates and, through them, to
/// their execution contexts.
pub struct Runtime {
    logger: Arc<Logger>,
    config: RuntimeConfig,
    backend: Arc<dyn KernelBackend>,
    recorder: Option<Arc<dyn ErrorRecorder>>,
    live_engines: Arc<AtomicUsize>,
}

impl Runtime {
    /// Create a runtime with the default configuration and the CPU backend.
    pub fn new(logger: Arc<Logger>) -> Self {
        Self::with_config(logger, RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(logger: Arc<Logger>, config: RuntimeConfig) -> Self {
        Self {
            logger,
            config,
            backend: Arc::new(CpuBackend::new()),
            recorder: None,
            live_engines: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Use `backend` to run the engines deserialized from now on.
    pub fn with_backend(mut self, backend: Arc<dyn KernelBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Set the recorder handed to engines deserialized from now on.
    pub fn set_error_recorder(&mut self, recorder: Option<Arc<dyn ErrorRecorder>>) {
        self.recorder = recorder;
    }

    /// The current error recorder.
    pub fn error_recorder(&self) -> Option<Arc<dyn ErrorRecorder>> {
        self.recorder.clone()
    }

    /// The logger this runtime reports to.
    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of engines created by this runtime that are still alive.
    pub fn nb_live_engines(&self) -> usize {
        self.live_engines.load(Ordering::Acquire)
    }

    /// Deserialize an engine from `blob`.
    ///
    /// Returns `None` if the blob is corrupt, truncated, of another format
    /// version, larger than `engine.max_blob_size`, inconsistent, or if
    /// memory for its constants cannot be allocated. Each failure sends
    /// exactly one `Error` message to the logger. `blob` is not retained.
    pub fn deserialize_engine(&self, blob: &[u8]) -> Option<Engine> {
        match self.try_deserialize_engine(blob) {
            Ok(engine) => {
                self.logger.log(
                    Severity::Verbose,
                    &format!(
                        "deserialized engine '{}' with {} IO tensors and {} optimization profile(s)",
                        engine.name(),
                        engine.nb_io_tensors(),
                        engine.nb_optimization_profiles()
                    ),
                );
                Some(engine)
            }
            Err(e) => {
                Reporter::new(Arc::clone(&self.logger), self.recorder.clone())
                    .error(ErrorCode::from(&e), &format!("failed to deserialize engine: {}", e));
                None
            }
        }
    }

    /// Deserialize an engine without logging, returning the typed error.
    pub fn try_deserialize_engine(&self, blob: &[u8]) -> Result<Engine> {
        debug!("Deserializing engine blob of {} bytes", blob.len());
        let engine = Engine::load(
            blob,
            EngineParts {
                logger: Arc::clone(&self.logger),
                backend: Arc::clone(&self.backend),
                recorder: self.recorder.clone(),
                config: self.config.clone(),
                live_engines: Arc::clone(&self.live_engines),
            },
        )?;
        debug!("Loaded engine '{}' on the {} backend", engine.name(), engine.backend_name());
        Ok(engine)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let live = self.nb_live_engines();
        if live > 0 {
            // Engines hold their own logger and backend.
            self.logger.log(
                Severity::Info,
                &format!("runtime destroyed before {} engine(s) it created", live),
            );
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend.name())
            .field("live_engines", &self.nb_live_engines())
            .field("config", &self.config)
            .finish()
    }
}
