//! Execution contexts: per-invocation bindings and launches.

use std::ffi::c_void;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use leanrt_kernels::{TensorView, TensorViewMut};

use crate::blob::TensorKind;
use crate::dims::Dims;
use crate::engine::EngineInner;
use crate::error::{BindingError, LeanError, Result};
use crate::memory::{AlignedBuffer, TensorAddress, is_aligned};
use crate::plan::{LaunchLayout, Step};
use crate::recorder::{ErrorCode, Reporter};
use crate::stream::{Event, Stream};

/// How a context provisions activation memory. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum AllocationStrategy {
    /// Allocate the maximum size over all profiles when the context is created.
    Static = 0,
    /// Allocate for the selected profile at the first launch after a switch.
    OnProfileChange = 1,
    /// The caller supplies activation memory with `set_device_memory`.
    UserManaged = 2,
}

impl AllocationStrategy {
    /// Look up a strategy by its numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(AllocationStrategy::Static),
            1 => Some(AllocationStrategy::OnProfileChange),
            2 => Some(AllocationStrategy::UserManaged),
            _ => None,
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationStrategy::Static => "static",
            AllocationStrategy::OnProfileChange => "on_profile_change",
            AllocationStrategy::UserManaged => "user_managed",
        };
        f.write_str(name)
    }
}

/// Binding state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// No IO tensor is bound.
    Created,
    /// Some, but not all, IO tensors are bound.
    PartiallyBound,
    /// Every IO tensor is bound.
    Ready,
    /// The last launch has not completed yet.
    Enqueued,
}

enum Activations {
    None,
    /// Runtime-owned memory sized for `profile`, or for every profile.
    Owned {
        buffer: Arc<AlignedBuffer>,
        profile: Option<usize>,
    },
    User {
        addr: TensorAddress,
        size: usize,
    },
}

/// Mutable execution state bound to one engine.
///
/// A context holds the address bound to each IO tensor (initially none),
/// explicit input shapes, the selected optimization profile and the
/// activation memory for its strategy. Contexts created from one engine are
/// independent and may be launched concurrently on different streams.
///
/// Bound addresses are borrowed: the context stores them without tracking
/// the lifetime or size of the memory behind them.
pub struct ExecutionContext {
    engine: Arc<EngineInner>,
    strategy: AllocationStrategy,
    reporter: Reporter,
    addresses: Vec<Option<TensorAddress>>,
    shapes: Vec<Option<Vec<i64>>>,
    profile: usize,
    activations: Activations,
    input_consumed: Option<Event>,
    last_launch: Option<Event>,
    warned_default_stream: bool,
}

impl ExecutionContext {
    pub(crate) fn new(engine: Arc<EngineInner>, strategy: AllocationStrategy) -> Result<Self> {
        let activations = match strategy {
            AllocationStrategy::Static => {
                let size = engine.plan.max_activation_size();
                let buffer = AlignedBuffer::new(size).ok_or(BindingError::Allocation(size))?;
                Activations::Owned {
                    buffer: Arc::new(buffer),
                    profile: None,
                }
            }
            AllocationStrategy::OnProfileChange | AllocationStrategy::UserManaged => Activations::None,
        };

        let nb_tensors = engine.plan.tensors.len();
        let reporter = engine.reporter();
        engine.context_created();
        trace!("Created {} execution context on '{}'", strategy, engine.plan.name);

        Ok(Self {
            engine,
            strategy,
            reporter,
            addresses: vec![None; nb_tensors],
            shapes: vec![None; nb_tensors],
            profile: 0,
            activations,
            input_consumed: None,
            last_launch: None,
            warned_default_stream: false,
        })
    }

    /// Allocation strategy chosen at creation.
    pub fn allocation_strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Bind `ptr` to the IO tensor `name`; a null `ptr` unbinds it.
    ///
    /// Returns `false` only if `name` is not an IO tensor. The memory must be
    /// 256-byte aligned and live where `Engine::tensor_location` says; that
    /// is not checked here beyond an advisory warning for misalignment.
    pub fn set_tensor_address(&mut self, name: &str, ptr: *mut c_void) -> bool {
        let Some(index) = self.io_index(name) else {
            return false;
        };
        let addr = TensorAddress::new(ptr);
        if addr.is_some() && !is_aligned(ptr) && self.engine.config.context.warn_on_misaligned {
            self.reporter.warning(&format!(
                "address {:p} bound to '{}' is not 256-byte aligned",
                ptr, name
            ));
        }
        self.addresses[index] = addr;
        true
    }

    /// Address bound to the IO tensor `name`.
    pub fn tensor_address(&self, name: &str) -> Option<NonNull<c_void>> {
        let index = self.engine.plan.lookup_io(name)?;
        self.addresses[index].map(TensorAddress::get)
    }

    /// Set the shape of input `name` for the next launches.
    ///
    /// Every dimension must be known, match the engine's fixed dimensions and
    /// lie within the selected profile's range.
    pub fn set_input_shape(&mut self, name: &str, dims: &Dims) -> bool {
        let Some(index) = self.io_index(name) else {
            return false;
        };
        match self.engine.plan.check_input_shape(index, self.profile, dims.as_slice()) {
            Ok(()) => {
                self.shapes[index] = Some(dims.as_slice().to_vec());
                true
            }
            Err(e) => {
                self.report(&e.into());
                false
            }
        }
    }

    /// Shape of an IO tensor as resolved by this context.
    ///
    /// Outputs are fully resolved once every input dimension is specified.
    pub fn tensor_shape(&self, name: &str) -> Dims {
        let plan = &self.engine.plan;
        let Some(index) = plan.lookup_io(name) else {
            return Dims::UNKNOWN;
        };
        let dims = match plan.tensors[index].kind {
            TensorKind::Input => self.input_dims(index),
            _ if self.all_input_dimensions_specified() => match plan.layout(|i| self.input_dims(i)) {
                Ok(layout) => layout.dims[index].iter().map(|&d| d as i64).collect(),
                Err(_) => plan.tensors[index].dims.clone(),
            },
            _ => plan.tensors[index].dims.clone(),
        };
        Dims::new(&dims).unwrap_or(Dims::UNKNOWN)
    }

    /// Whether every input has fully known dims.
    pub fn all_input_dimensions_specified(&self) -> bool {
        let plan = &self.engine.plan;
        plan.io
            .iter()
            .filter(|&&i| plan.tensors[i].kind == TensorKind::Input)
            .all(|&i| self.input_dims(i).iter().all(|&d| d >= 0))
    }

    /// Select the optimization profile used by later launches.
    ///
    /// Switching profiles clears explicit input shapes.
    pub fn set_optimization_profile(&mut self, profile: usize) -> bool {
        let count = self.engine.plan.nb_profiles();
        if profile >= count {
            self.report(&BindingError::ProfileOutOfRange { index: profile, count }.into());
            return false;
        }
        if profile != self.profile {
            self.profile = profile;
            self.shapes.iter_mut().for_each(|shape| *shape = None);
        }
        true
    }

    /// Selected optimization profile.
    pub fn optimization_profile(&self) -> usize {
        self.profile
    }

    /// Supply activation memory for a `UserManaged` context.
    ///
    /// `size` must cover `Engine::device_memory_size`. The memory must stay
    /// valid until every launch using it has completed.
    pub fn set_device_memory(&mut self, ptr: *mut c_void, size: usize) -> bool {
        match self.try_set_device_memory(ptr, size) {
            Ok(()) => true,
            Err(e) => {
                self.report(&e.into());
                false
            }
        }
    }

    fn try_set_device_memory(&mut self, ptr: *mut c_void, size: usize) -> std::result::Result<(), BindingError> {
        if self.strategy != AllocationStrategy::UserManaged {
            return Err(BindingError::WrongStrategy(self.strategy));
        }
        let addr = TensorAddress::new(ptr).ok_or(BindingError::MissingDeviceMemory)?;
        let required = self.engine.plan.max_activation_size();
        if size < required {
            return Err(BindingError::DeviceMemoryTooSmall { size, required });
        }
        self.activations = Activations::User { addr, size };
        Ok(())
    }

    /// Event signalled once every kernel reading an engine input has run,
    /// after which input buffers may be reused. `None` removes it.
    pub fn set_input_consumed_event(&mut self, event: Option<Event>) {
        self.input_consumed = event;
    }

    /// The input-consumed event, if set.
    pub fn input_consumed_event(&self) -> Option<&Event> {
        self.input_consumed.as_ref()
    }

    /// Binding state of the context.
    pub fn state(&self) -> ContextState {
        if self.last_launch.as_ref().is_some_and(|event| !event.query()) {
            return ContextState::Enqueued;
        }
        let plan = &self.engine.plan;
        let bound = plan.io.iter().filter(|&&i| self.addresses[i].is_some()).count();
        if bound == plan.io.len() {
            ContextState::Ready
        } else if bound == 0 {
            ContextState::Created
        } else {
            ContextState::PartiallyBound
        }
    }

    /// Submit one execution of the engine to `stream`.
    ///
    /// Returns `false` without side effects if an IO tensor is unbound, an
    /// input shape is unresolved, activation memory is missing or too small,
    /// or the stream no longer accepts work; the cause is logged. Returns
    /// `true` once the launch is queued, not when it completes: synchronize
    /// the stream before reading outputs or reusing inputs.
    ///
    /// Enqueueing on `Stream::default_stream()` is allowed but serializes
    /// with all other users of that stream.
    ///
    /// # Safety
    /// Until the launch completes, every bound address and user-managed
    /// activation memory must point to live memory large enough for the
    /// resolved shape, aligned for its element type, and not aliased by
    /// another tensor of the launch. Launches of one context must not run
    /// concurrently on different streams.
    pub unsafe fn enqueue(&mut self, stream: &Stream) -> bool {
        match self.try_enqueue(stream) {
            Ok(()) => true,
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    /// Same as [`enqueue`](Self::enqueue).
    ///
    /// # Safety
    /// See [`enqueue`](Self::enqueue).
    pub unsafe fn enqueue_v3(&mut self, stream: &Stream) -> bool {
        unsafe { self.enqueue(stream) }
    }

    fn try_enqueue(&mut self, stream: &Stream) -> Result<()> {
        let plan = &self.engine.plan;
        for &i in &plan.io {
            if self.addresses[i].is_none() {
                return Err(BindingError::MissingAddress(plan.tensors[i].name.clone()).into());
            }
        }
        for &i in &plan.io {
            if plan.tensors[i].kind == TensorKind::Input && self.input_dims(i).contains(&-1) {
                return Err(BindingError::UnresolvedShape(plan.tensors[i].name.clone()).into());
            }
        }

        let layout = plan.layout(|i| self.input_dims(i))?;
        let (base, keep_alive) = self.activation_memory(layout.activation_bytes)?;

        let addresses = self.launch_addresses(&layout, base);

        if stream.is_default() && !self.warned_default_stream {
            self.warned_default_stream = true;
            if self.engine.config.context.warn_on_default_stream {
                self.reporter.warning(
                    "enqueue on the default stream serializes with other work and may add \
                     synchronization; use a dedicated stream for overlap",
                );
            }
        }

        let done = Event::new();
        done.arm();
        if let Some(event) = &self.input_consumed {
            event.arm();
        }

        let launch = Launch {
            engine: Arc::clone(&self.engine),
            reporter: self.reporter.clone(),
            layout,
            addresses,
            _activations: keep_alive,
            consumed_pending: self.input_consumed.is_some(),
            input_consumed: self.input_consumed.clone(),
            done: done.clone(),
        };

        // A task the stream refuses is dropped unrun, which signals its events.
        stream.submit(move || launch.run())?;

        trace!("Enqueued '{}' on stream {}", self.engine.plan.name, stream.id());
        self.last_launch = Some(done);
        Ok(())
    }

    /// Base of the activation memory for a launch needing `required` bytes.
    fn activation_memory(&mut self, required: usize) -> Result<(*mut u8, Option<Arc<AlignedBuffer>>)> {
        if self.strategy == AllocationStrategy::OnProfileChange {
            let current = matches!(
                &self.activations,
                Activations::Owned { profile: Some(p), .. } if *p == self.profile
            );
            if !current {
                let size = self.engine.plan.activation_size(self.profile).unwrap_or(0);
                let buffer = AlignedBuffer::new(size).ok_or(BindingError::Allocation(size))?;
                trace!("Allocated {} activation bytes for profile {}", size, self.profile);
                self.activations = Activations::Owned {
                    buffer: Arc::new(buffer),
                    profile: Some(self.profile),
                };
            }
        }

        let (base, size, keep_alive) = match &self.activations {
            Activations::None => return Err(BindingError::MissingDeviceMemory.into()),
            Activations::Owned { buffer, .. } => (buffer.base_ptr(), buffer.len(), Some(Arc::clone(buffer))),
            Activations::User { addr, size } => (addr.as_bytes_ptr(), *size, None),
        };
        if size < required {
            return Err(BindingError::DeviceMemoryTooSmall { size, required }.into());
        }
        Ok((base, keep_alive))
    }

    fn launch_addresses(&self, layout: &LaunchLayout, activations: *mut u8) -> Vec<Option<TensorAddress>> {
        let engine = &self.engine;
        engine
            .plan
            .tensors
            .iter()
            .enumerate()
            .map(|(i, info)| match info.kind {
                TensorKind::Input | TensorKind::Output => self.addresses[i],
                TensorKind::Constant => engine.constants[i]
                    .as_ref()
                    .and_then(|buffer| TensorAddress::new(buffer.base_ptr().cast())),
                TensorKind::Activation => layout.offsets[i].and_then(|offset| {
                    // The offset lies inside the activation memory checked above.
                    TensorAddress::new(activations.wrapping_add(offset).cast())
                }),
            })
            .collect()
    }

    fn io_index(&self, name: &str) -> Option<usize> {
        let index = self.engine.plan.lookup_io(name);
        if index.is_none() {
            self.report(&BindingError::UnknownTensor(name.to_string()).into());
        }
        index
    }

    fn input_dims(&self, index: usize) -> Vec<i64> {
        self.shapes[index]
            .clone()
            .unwrap_or_else(|| self.engine.plan.tensors[index].dims.clone())
    }

    fn report(&self, err: &LeanError) {
        self.reporter.error(ErrorCode::from(err), &err.to_string());
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.last_launch.as_ref().is_some_and(|event| !event.query()) {
            self.reporter.warning(&format!(
                "execution context on '{}' destroyed with a launch still in flight",
                self.engine.plan.name
            ));
        }
        self.engine.context_dropped();
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("engine", &self.engine.plan.name)
            .field("strategy", &self.strategy)
            .field("profile", &self.profile)
            .field("state", &self.state())
            .finish()
    }
}

/// One launch of the plan, moved to the stream worker.
///
/// Its events are signalled when it is dropped, whether it ran to the end,
/// failed, unwound or never ran at all.
struct Launch {
    engine: Arc<EngineInner>,
    reporter: Reporter,
    layout: LaunchLayout,
    addresses: Vec<Option<TensorAddress>>,
    _activations: Option<Arc<AlignedBuffer>>,
    consumed_pending: bool,
    input_consumed: Option<Event>,
    done: Event,
}

impl Launch {
    fn run(mut self) -> std::result::Result<(), String> {
        if self.engine.plan.last_input_reader.is_none() {
            self.signal_consumed();
        }

        self.run_steps()
            .inspect_err(|msg| self.reporter.error(ErrorCode::FailedExecution, msg))
    }

    fn run_steps(&mut self) -> std::result::Result<(), String> {
        let engine = Arc::clone(&self.engine);
        let plan = &engine.plan;
        for (s, step) in plan.steps.iter().enumerate() {
            self.run_step(s, step)?;
            if plan.last_input_reader == Some(s) {
                self.signal_consumed();
            }
        }
        Ok(())
    }

    fn run_step(&self, s: usize, step: &Step) -> std::result::Result<(), String> {
        let plan = &self.engine.plan;
        let inputs: Vec<TensorView<'_>> = step
            .inputs
            .iter()
            .map(|&i| TensorView {
                dtype: plan.tensors[i].dtype,
                dims: &self.layout.dims[i],
                data: self.address(i).cast_const(),
            })
            .collect();
        let output = TensorViewMut {
            dtype: plan.tensors[step.output].dtype,
            dims: &self.layout.dims[step.output],
            data: self.address(step.output),
        };

        // SAFETY: IO addresses are covered by the `enqueue` contract;
        // constants and activations point into memory this launch keeps
        // alive, sized by the layout.
        let outcome = catch_unwind(AssertUnwindSafe(|| unsafe {
            self.engine.backend.launch(&step.op, &inputs, output)
        }));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("'{}' op {} ({}) failed: {}", plan.name, s, step.op.name(), e)),
            Err(_) => Err(format!("'{}' op {} ({}) panicked", plan.name, s, step.op.name())),
        }
    }

    fn address(&self, index: usize) -> *mut u8 {
        self.addresses[index].map_or(std::ptr::null_mut(), TensorAddress::as_bytes_ptr)
    }

    fn signal_consumed(&mut self) {
        if let (true, Some(event)) = (self.consumed_pending, &self.input_consumed) {
            event.signal();
            self.consumed_pending = false;
        }
    }
}

impl Drop for Launch {
    fn drop(&mut self) {
        self.signal_consumed();
        self.done.signal();
    }
}
