//! Deserialized engines.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use leanrt_kernels::{DataType, KernelBackend};

use crate::blob::{DecodeOptions, EngineBlob, TensorLocation};
use crate::config::RuntimeConfig;
use crate::context::{AllocationStrategy, ExecutionContext};
use crate::dims::Dims;
use crate::error::{LeanError, Result};
use crate::logger::Logger;
use crate::memory::AlignedBuffer;
use crate::plan::Plan;
use crate::recorder::{ErrorCode, ErrorRecorder, Reporter};

/// Direction of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TensorIoMode {
    /// Not an IO tensor of the engine.
    None = 0,
    Input = 1,
    Output = 2,
}

/// Which bound of an optimization profile to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProfileSelector {
    Min = 0,
    Opt = 1,
    Max = 2,
}

/// State shared by an engine and every context created from it.
pub(crate) struct EngineInner {
    pub(crate) plan: Plan,
    /// Constant payloads, indexed like the plan's tensors.
    pub(crate) constants: Vec<Option<AlignedBuffer>>,
    pub(crate) backend: Arc<dyn KernelBackend>,
    pub(crate) config: RuntimeConfig,
    logger: Arc<Logger>,
    recorder: RwLock<Option<Arc<dyn ErrorRecorder>>>,
    live_contexts: AtomicUsize,
}

impl EngineInner {
    pub(crate) fn reporter(&self) -> Reporter {
        let recorder = self
            .recorder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Reporter::new(Arc::clone(&self.logger), recorder)
    }

    pub(crate) fn context_created(&self) {
        self.live_contexts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn context_dropped(&self) {
        self.live_contexts.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a runtime hands to the engines it deserializes.
pub(crate) struct EngineParts {
    pub(crate) logger: Arc<Logger>,
    pub(crate) backend: Arc<dyn KernelBackend>,
    pub(crate) recorder: Option<Arc<dyn ErrorRecorder>>,
    pub(crate) config: RuntimeConfig,
    pub(crate) live_engines: Arc<AtomicUsize>,
}

/// Immutable compiled-model handle.
///
/// An engine exposes the metadata of its IO tensors and creates execution
/// contexts. Each context shares the engine's state, so dropping the
/// `Engine` while contexts are alive is reported as a programming error
/// but never invalidates them.
///
/// Name-keyed queries on unknown names (internal tensors included) return a
/// sentinel (`None`, `TensorIoMode::None`, `Dims::UNKNOWN`) without logging.
pub struct Engine {
    inner: Arc<EngineInner>,
    live_engines: Arc<AtomicUsize>,
}

impl Engine {
    pub(crate) fn load(blob: &[u8], parts: EngineParts) -> Result<Self> {
        let options = DecodeOptions {
            max_size: parts.config.engine.max_blob_size,
            verify_checksum: parts.config.engine.verify_checksum,
        };
        let decoded = EngineBlob::from_bytes(blob, &options)?;
        let (plan, constant_data) = Plan::build(decoded, parts.backend.as_ref())?;

        let mut constants: Vec<Option<AlignedBuffer>> = (0..plan.tensors.len()).map(|_| None).collect();
        for (i, data) in constant_data {
            let data = to_native(plan.tensors[i].dtype, data);
            let buffer = AlignedBuffer::from_bytes(&data).ok_or(LeanError::Allocation(data.len()))?;
            constants[i] = Some(buffer);
        }

        parts.live_engines.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            inner: Arc::new(EngineInner {
                plan,
                constants,
                backend: parts.backend,
                config: parts.config,
                logger: parts.logger,
                recorder: RwLock::new(parts.recorder),
                live_contexts: AtomicUsize::new(0),
            }),
            live_engines: parts.live_engines,
        })
    }

    /// Engine name stored in the blob.
    pub fn name(&self) -> &str {
        &self.inner.plan.name
    }

    /// Name of the kernel backend running this engine.
    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Create a context with the given allocation strategy.
    ///
    /// The context starts on optimization profile 0 with every tensor
    /// unbound. Returns `None`, after logging, if activation memory cannot be
    /// allocated.
    pub fn create_execution_context(&self, strategy: AllocationStrategy) -> Option<ExecutionContext> {
        match ExecutionContext::new(Arc::clone(&self.inner), strategy) {
            Ok(context) => Some(context),
            Err(e) => {
                self.inner.reporter().error(
                    ErrorCode::from(&e),
                    &format!("failed to create execution context: {}", e),
                );
                None
            }
        }
    }

    /// Create a context with the configured default strategy.
    pub fn create_default_execution_context(&self) -> Option<ExecutionContext> {
        self.create_execution_context(self.inner.config.context.default_strategy)
    }

    /// Number of IO tensors.
    pub fn nb_io_tensors(&self) -> usize {
        self.inner.plan.io.len()
    }

    /// Name of the IO tensor at `index`, in blob order.
    pub fn io_tensor_name(&self, index: usize) -> Option<&str> {
        let plan = &self.inner.plan;
        plan.io.get(index).map(|&i| plan.tensors[i].name.as_str())
    }

    /// Whether `name` is an input, an output, or neither.
    pub fn tensor_io_mode(&self, name: &str) -> TensorIoMode {
        let plan = &self.inner.plan;
        plan.lookup_io(name)
            .map_or(TensorIoMode::None, |i| plan.tensors[i].io_mode())
    }

    /// Element type of an IO tensor.
    pub fn tensor_data_type(&self, name: &str) -> Option<DataType> {
        let plan = &self.inner.plan;
        plan.lookup_io(name).map(|i| plan.tensors[i].dtype)
    }

    /// Engine-level shape of an IO tensor.
    ///
    /// A `-1` dimension of an input is set per context with
    /// `set_input_shape`; a `-1` dimension of an output depends on the input
    /// shapes and is known from the context once they are set.
    pub fn tensor_shape(&self, name: &str) -> Dims {
        let plan = &self.inner.plan;
        plan.lookup_io(name)
            .and_then(|i| Dims::new(&plan.tensors[i].dims))
            .unwrap_or(Dims::UNKNOWN)
    }

    /// Where memory bound to an IO tensor must live.
    pub fn tensor_location(&self, name: &str) -> Option<TensorLocation> {
        let plan = &self.inner.plan;
        plan.lookup_io(name).map(|i| plan.tensors[i].location)
    }

    /// Number of optimization profiles. Engines without dynamic inputs have
    /// one implicit profile.
    pub fn nb_optimization_profiles(&self) -> usize {
        self.inner.plan.nb_profiles()
    }

    /// Min, opt or max dims of input `name` in `profile`.
    pub fn profile_shape(&self, name: &str, profile: usize, selector: ProfileSelector) -> Dims {
        let plan = &self.inner.plan;
        plan.lookup_io(name)
            .and_then(|i| plan.profile_dims(i, profile, selector))
            .and_then(|dims| Dims::new(&dims))
            .unwrap_or(Dims::UNKNOWN)
    }

    /// Activation memory a user-managed context must supply: the maximum
    /// over every profile.
    pub fn device_memory_size(&self) -> usize {
        self.inner.plan.max_activation_size()
    }

    /// Activation memory needed by `profile`.
    pub fn device_memory_size_for_profile(&self, profile: usize) -> Option<usize> {
        self.inner.plan.activation_size(profile)
    }

    /// Number of execution contexts alive on this engine.
    pub fn nb_live_contexts(&self) -> usize {
        self.inner.live_contexts.load(Ordering::Acquire)
    }

    /// Set the recorder handed to contexts created from now on.
    pub fn set_error_recorder(&self, recorder: Option<Arc<dyn ErrorRecorder>>) {
        *self.inner.recorder.write().unwrap_or_else(PoisonError::into_inner) = recorder;
    }

    /// The current error recorder.
    pub fn error_recorder(&self) -> Option<Arc<dyn ErrorRecorder>> {
        self.inner
            .recorder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let live = self.nb_live_contexts();
        if live > 0 {
            self.inner.reporter().warning(&format!(
                "engine '{}' destroyed while {} execution context(s) still use it",
                self.name(),
                live
            ));
        }
        self.live_engines.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name())
            .field("nb_io_tensors", &self.nb_io_tensors())
            .field("nb_optimization_profiles", &self.nb_optimization_profiles())
            .field("backend", &self.backend_name())
            .finish()
    }
}

/// Blob constants are little endian; kernels read native order.
fn to_native(dtype: DataType, mut data: Vec<u8>) -> Vec<u8> {
    let width = dtype.size_bits() / 8;
    if cfg!(target_endian = "big") && width > 1 {
        for element in data.chunks_exact_mut(width) {
            element.reverse();
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::EngineManifest;
    use crate::runtime::Runtime;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"{
        "name": "scaled",
        "tensors": [
            {"name": "x", "kind": "input", "dims": [-1, 3]},
            {"name": "w", "kind": "constant", "dims": [3], "values": [1, 2, 3]},
            {"name": "t", "kind": "activation", "dims": [-1, 3]},
            {"name": "y", "kind": "output", "location": "host", "dims": [-1, 3]}
        ],
        "profiles": [
            {"x": {"min": [1, 3], "opt": [2, 3], "max": [4, 3]}},
            {"x": {"min": [5, 3], "opt": [6, 3], "max": [8, 3]}}
        ],
        "ops": [
            {"op": "mul", "inputs": ["x", "w"], "output": "t"},
            {"op": "relu", "inputs": ["t"], "output": "y"}
        ]
    }"#;

    fn engine() -> Engine {
        let bytes = EngineManifest::from_json(MANIFEST)
            .unwrap()
            .into_blob()
            .unwrap()
            .to_bytes();
        Runtime::new(Arc::new(Logger::new()))
            .deserialize_engine(&bytes)
            .unwrap()
    }

    #[test]
    fn test_io_metadata() {
        let engine = engine();
        assert_eq!(engine.name(), "scaled");
        assert_eq!(engine.nb_io_tensors(), 2);
        assert_eq!(engine.io_tensor_name(0), Some("x"));
        assert_eq!(engine.io_tensor_name(1), Some("y"));
        assert_eq!(engine.io_tensor_name(2), None);
        assert_eq!(engine.tensor_io_mode("x"), TensorIoMode::Input);
        assert_eq!(engine.tensor_io_mode("y"), TensorIoMode::Output);
        assert_eq!(engine.tensor_data_type("y"), Some(DataType::Float));
        assert_eq!(engine.tensor_location("y"), Some(TensorLocation::Host));
        assert_eq!(engine.tensor_shape("x").as_slice(), &[-1, 3]);
    }

    #[test]
    fn test_internal_tensors_are_hidden() {
        let engine = engine();
        for name in ["w", "t", "missing", ""] {
            assert_eq!(engine.tensor_io_mode(name), TensorIoMode::None);
            assert_eq!(engine.tensor_data_type(name), None);
            assert!(engine.tensor_shape(name).is_unknown());
        }
    }

    #[test]
    fn test_profiles_and_memory() {
        let engine = engine();
        assert_eq!(engine.nb_optimization_profiles(), 2);
        assert_eq!(
            engine.profile_shape("x", 1, ProfileSelector::Max).as_slice(),
            &[8, 3]
        );
        assert!(engine.profile_shape("y", 0, ProfileSelector::Min).is_unknown());
        // One activation of 4x3 / 8x3 floats, each aligned to 256 bytes.
        assert_eq!(engine.device_memory_size_for_profile(0), Some(256));
        assert_eq!(engine.device_memory_size_for_profile(1), Some(256));
        assert_eq!(engine.device_memory_size_for_profile(2), None);
        assert_eq!(engine.device_memory_size(), 256);
    }

    #[test]
    fn test_live_context_count() {
        let engine = engine();
        let a = engine.create_execution_context(AllocationStrategy::Static).unwrap();
        let b = engine.create_default_execution_context().unwrap();
        assert_eq!(engine.nb_live_contexts(), 2);
        drop(a);
        drop(b);
        assert_eq!(engine.nb_live_contexts(), 0);
    }

    #[test]
    fn test_to_native_keeps_single_bytes() {
        assert_eq!(to_native(DataType::Int8, vec![1, 2, 3]), vec![1, 2, 3]);
    }
}
