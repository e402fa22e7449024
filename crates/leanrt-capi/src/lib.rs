//! C bindings for leanrt.
//!
//! Every object crosses the boundary as an opaque boxed handle created by a
//! `leanrt_*_create*` function and released by the matching `*_destroy`.
//! Enumerations are passed as their `i32` codes. All functions accept null
//! handles and answer with the same "not found" values as the Rust API.
//!
//! Runtimes report through one process-wide logger whose callback is set
//! with `leanrt_set_logger_callback`.

use std::borrow::Cow;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;
use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::debug;

use leanrt_core::{AllocationStrategy, Dims, Engine, ExecutionContext, Logger, Runtime, Severity, Stream};

lazy_static! {
    static ref LOGGER: Arc<Logger> = Arc::new(Logger::new());
}

/// Logger callback receiving a severity code and a NUL-terminated message.
///
/// The message pointer is only valid for the duration of the call.
pub type LeanrtLogCallback = Option<unsafe extern "C" fn(severity: i32, msg: *const c_char)>;

/// Engine handle. Caches the IO tensor names as C strings.
pub struct LeanrtEngine {
    engine: Engine,
    io_names: Vec<CString>,
}

impl LeanrtEngine {
    fn new(engine: Engine) -> Self {
        let io_names = (0..engine.nb_io_tensors())
            .filter_map(|i| engine.io_tensor_name(i))
            .filter_map(|name| CString::new(name).ok())
            .collect();
        Self { engine, io_names }
    }
}

/// Borrow a C string as a tensor name. Null gives `None`; invalid UTF-8 is
/// replaced and then fails the lookup like any unknown name.
unsafe fn name_arg<'a>(name: *const c_char) -> Option<Cow<'a, str>> {
    if name.is_null() {
        return None;
    }
    // SAFETY: the caller passes a NUL-terminated string.
    Some(unsafe { CStr::from_ptr(name) }.to_string_lossy())
}

fn forward(callback: unsafe extern "C" fn(i32, *const c_char), severity: Severity, msg: &str) {
    let msg = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    // SAFETY: the registered callback accepts any severity code and a
    // NUL-terminated string valid for this call.
    unsafe { callback(severity as i32, msg.as_ptr()) }
}

// Logger

/// The global logger handed to `leanrt_create_infer_runtime`.
#[unsafe(no_mangle)]
pub extern "C" fn leanrt_get_logger() -> *const Logger {
    Arc::as_ptr(&LOGGER)
}

/// Set the callback of the global logger. Null silences it.
///
/// The callback may be invoked from any thread, including stream workers.
#[unsafe(no_mangle)]
pub extern "C" fn leanrt_set_logger_callback(callback: LeanrtLogCallback) {
    match callback {
        Some(callback) => LOGGER.set_callback(move |severity, msg| forward(callback, severity, msg)),
        None => LOGGER.clear_callback(),
    }
}

// Runtime

/// Create a runtime reporting to `logger`, which must be null or the
/// pointer returned by `leanrt_get_logger`.
#[unsafe(no_mangle)]
pub extern "C" fn leanrt_create_infer_runtime(logger: *const Logger) -> *mut Runtime {
    if !logger.is_null() && logger != Arc::as_ptr(&LOGGER) {
        LOGGER.log(Severity::Error, "leanrt_create_infer_runtime: unknown logger handle");
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(Runtime::new(Arc::clone(&LOGGER))))
}

/// Deserialize an engine from `size` bytes at `blob`. Returns null on failure.
///
/// # Safety
/// `runtime` must be null or a live runtime handle; `blob` must point to
/// `size` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_runtime_deserialize_engine(
    runtime: *mut Runtime,
    blob: *const c_void,
    size: usize,
) -> *mut LeanrtEngine {
    // SAFETY: per the function contract.
    let Some(runtime) = (unsafe { runtime.as_ref() }) else {
        return ptr::null_mut();
    };
    let bytes: &[u8] = if size == 0 {
        &[]
    } else if blob.is_null() {
        runtime.logger().log(Severity::Error, "failed to deserialize engine: null blob");
        return ptr::null_mut();
    } else {
        // SAFETY: per the function contract.
        unsafe { std::slice::from_raw_parts(blob.cast::<u8>(), size) }
    };

    match runtime.deserialize_engine(bytes) {
        Some(engine) => Box::into_raw(Box::new(LeanrtEngine::new(engine))),
        None => ptr::null_mut(),
    }
}

/// Release a runtime. Engines it created stay usable.
///
/// # Safety
/// `runtime` must be null or a handle not yet destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_runtime_destroy(runtime: *mut Runtime) {
    if !runtime.is_null() {
        // SAFETY: created by `Box::into_raw` in `leanrt_create_infer_runtime`.
        drop(unsafe { Box::from_raw(runtime) });
    }
}

// Engine

/// Create an execution context with the given allocation strategy code.
///
/// # Safety
/// `engine` must be null or a live engine handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_engine_create_execution_context(
    engine: *mut LeanrtEngine,
    strategy: i32,
) -> *mut ExecutionContext {
    // SAFETY: per the function contract.
    let Some(handle) = (unsafe { engine.as_ref() }) else {
        return ptr::null_mut();
    };
    let Some(strategy) = AllocationStrategy::from_code(strategy) else {
        LOGGER.log(
            Severity::Error,
            &format!("invalid allocation strategy code {}", strategy),
        );
        return ptr::null_mut();
    };
    match handle.engine.create_execution_context(strategy) {
        Some(context) => Box::into_raw(Box::new(context)),
        None => ptr::null_mut(),
    }
}

/// Data type code of an IO tensor, or -1 for unknown names.
///
/// # Safety
/// `engine` must be null or a live engine handle; `tensor_name` must be null
/// or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_engine_get_tensor_data_type(
    engine: *const LeanrtEngine,
    tensor_name: *const c_char,
) -> i32 {
    // SAFETY: per the function contract.
    let (Some(handle), Some(name)) = (unsafe { engine.as_ref() }, unsafe { name_arg(tensor_name) }) else {
        return -1;
    };
    handle
        .engine
        .tensor_data_type(&name)
        .map_or(-1, |dtype| dtype.code())
}

/// Shape of an IO tensor; `nb_dims == -1` for unknown names.
///
/// # Safety
/// See `leanrt_engine_get_tensor_data_type`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_engine_get_tensor_shape(
    engine: *const LeanrtEngine,
    tensor_name: *const c_char,
) -> Dims {
    // SAFETY: per the function contract.
    let (Some(handle), Some(name)) = (unsafe { engine.as_ref() }, unsafe { name_arg(tensor_name) }) else {
        return Dims::UNKNOWN;
    };
    handle.engine.tensor_shape(&name)
}

/// IO mode code of a tensor: 0 none, 1 input, 2 output.
///
/// # Safety
/// See `leanrt_engine_get_tensor_data_type`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_engine_get_tensor_io_mode(
    engine: *const LeanrtEngine,
    tensor_name: *const c_char,
) -> i32 {
    // SAFETY: per the function contract.
    let (Some(handle), Some(name)) = (unsafe { engine.as_ref() }, unsafe { name_arg(tensor_name) }) else {
        return 0;
    };
    handle.engine.tensor_io_mode(&name) as i32
}

/// Number of IO tensors.
///
/// # Safety
/// `engine` must be null or a live engine handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_engine_get_nb_io_tensors(engine: *const LeanrtEngine) -> i32 {
    // SAFETY: per the function contract.
    unsafe { engine.as_ref() }.map_or(0, |handle| handle.io_names.len() as i32)
}

/// Name of the IO tensor at `index`, or null when out of range.
///
/// The string lives as long as the engine handle.
///
/// # Safety
/// `engine` must be null or a live engine handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_engine_get_io_tensor_name(
    engine: *const LeanrtEngine,
    index: i32,
) -> *const c_char {
    // SAFETY: per the function contract.
    let Some(handle) = (unsafe { engine.as_ref() }) else {
        return ptr::null();
    };
    usize::try_from(index)
        .ok()
        .and_then(|i| handle.io_names.get(i))
        .map_or(ptr::null(), |name| name.as_ptr())
}

/// Release an engine.
///
/// # Safety
/// `engine` must be null or a handle not yet destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_engine_destroy(engine: *mut LeanrtEngine) {
    if !engine.is_null() {
        // SAFETY: created by `Box::into_raw` in `leanrt_runtime_deserialize_engine`.
        drop(unsafe { Box::from_raw(engine) });
    }
}

// ExecutionContext

/// Bind `data` to the IO tensor `tensor_name`; null unbinds.
///
/// # Safety
/// `context` must be null or a live context handle; `tensor_name` must be
/// null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_context_set_tensor_address(
    context: *mut ExecutionContext,
    tensor_name: *const c_char,
    data: *mut c_void,
) -> bool {
    // SAFETY: per the function contract.
    let (Some(context), Some(name)) = (unsafe { context.as_mut() }, unsafe { name_arg(tensor_name) }) else {
        return false;
    };
    context.set_tensor_address(&name, data)
}

/// Set the runtime shape of an input.
///
/// # Safety
/// `context` must be null or a live context handle; `tensor_name` must be
/// null or NUL-terminated; `dims` must be null or point to a `Dims`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_context_set_input_shape(
    context: *mut ExecutionContext,
    tensor_name: *const c_char,
    dims: *const Dims,
) -> bool {
    // SAFETY: per the function contract.
    let (Some(context), Some(name), Some(dims)) = (
        unsafe { context.as_mut() },
        unsafe { name_arg(tensor_name) },
        unsafe { dims.as_ref() },
    ) else {
        return false;
    };
    context.set_input_shape(&name, dims)
}

/// Enqueue one execution on `stream`, or on the default stream when null.
///
/// # Safety
/// `context` and `stream` must be null or live handles. Every bound address
/// must satisfy the contract of `ExecutionContext::enqueue` until the
/// stream is synchronized.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_context_enqueue_v3(context: *mut ExecutionContext, stream: *mut Stream) -> bool {
    // SAFETY: per the function contract.
    let Some(context) = (unsafe { context.as_mut() }) else {
        return false;
    };
    // SAFETY: per the function contract.
    let stream = unsafe { stream.as_ref() }.unwrap_or_else(Stream::default_stream);
    // SAFETY: forwarded to the caller.
    unsafe { context.enqueue_v3(stream) }
}

/// Release a context.
///
/// # Safety
/// `context` must be null or a handle not yet destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_context_destroy(context: *mut ExecutionContext) {
    if !context.is_null() {
        // SAFETY: created by `Box::into_raw` in `leanrt_engine_create_execution_context`.
        drop(unsafe { Box::from_raw(context) });
    }
}

// Stream

/// Create a stream with its own worker thread. Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn leanrt_stream_create() -> *mut Stream {
    match Stream::new() {
        Ok(stream) => Box::into_raw(Box::new(stream)),
        Err(e) => {
            LOGGER.log(Severity::Error, &format!("failed to create stream: {}", e));
            ptr::null_mut()
        }
    }
}

/// Wait for all work queued on `stream` (the default stream when null).
///
/// Returns `false` if a launch failed since the previous synchronization.
///
/// # Safety
/// `stream` must be null or a live stream handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_stream_synchronize(stream: *mut Stream) -> bool {
    // SAFETY: per the function contract.
    let stream = unsafe { stream.as_ref() }.unwrap_or_else(Stream::default_stream);
    match stream.synchronize() {
        Ok(()) => true,
        Err(e) => {
            debug!("Stream {} synchronize failed: {}", stream.id(), e);
            false
        }
    }
}

/// Drain and release a stream.
///
/// # Safety
/// `stream` must be null or a handle not yet destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leanrt_stream_destroy(stream: *mut Stream) {
    if !stream.is_null() {
        // SAFETY: created by `Box::into_raw` in `leanrt_stream_create`.
        drop(unsafe { Box::from_raw(stream) });
    }
}
