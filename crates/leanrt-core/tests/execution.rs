//! End-to-end tests of the runtime contract: deserialize, bind, enqueue,
//! synchronize.

use std::sync::{Arc, Mutex};
use std::thread;

use leanrt_core::blob::TensorRecord;
use leanrt_core::{
    AlignedBuffer, AllocationStrategy, DataType, Dims, EngineBlob, EngineManifest, ErrorCode,
    ErrorLog, Logger, ProfileSelector, Runtime, Severity, Stream, TensorIoMode, TensorKind,
    TensorLocation,
};
use pretty_assertions::assert_eq;

type Messages = Arc<Mutex<Vec<(Severity, String)>>>;

fn recording_logger() -> (Arc<Logger>, Messages) {
    let seen: Messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let logger = Logger::with_callback(move |severity, msg: &str| {
        sink.lock().unwrap().push((severity, msg.to_string()));
    });
    (Arc::new(logger), seen)
}

fn errors(seen: &Messages) -> usize {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|(s, _)| s.is_at_least(Severity::Error))
        .count()
}

fn pack(manifest: &str) -> Vec<u8> {
    EngineManifest::from_json(manifest)
        .unwrap()
        .into_blob()
        .unwrap()
        .to_bytes()
}

/// input[2, 3] -> relu -> scale(0.5, 1) -> output[2, 3]
const STATIC_1IN_1OUT: &str = r#"{
    "name": "relu_scale",
    "tensors": [
        {"name": "input", "kind": "input", "dims": [2, 3]},
        {"name": "hidden", "kind": "activation", "dims": [2, 3]},
        {"name": "output", "kind": "output", "dims": [2, 3]}
    ],
    "ops": [
        {"op": "relu", "inputs": ["input"], "output": "hidden"},
        {"op": "scale", "scale": 0.5, "shift": 1.0, "inputs": ["hidden"], "output": "output"}
    ]
}"#;

/// tokens[-1, 4] x weights[4, 2] + bias[2] -> logits[-1, 2], plus a mask
/// output copied from an int32 input.
const DYNAMIC_2IN_2OUT: &str = r#"{
    "name": "linear",
    "tensors": [
        {"name": "tokens", "kind": "input", "dims": [-1, 4]},
        {"name": "mask", "kind": "input", "dtype": "int32", "dims": [-1]},
        {"name": "weights", "kind": "constant", "dims": [4, 2], "values": [1, 0, 0, 1, 1, 0, 0, 1]},
        {"name": "bias", "kind": "constant", "dims": [2], "values": [0.5, -0.5]},
        {"name": "projected", "kind": "activation", "dims": [-1, 2]},
        {"name": "logits", "kind": "output", "dims": [-1, 2]},
        {"name": "mask_out", "kind": "output", "dtype": "int32", "location": "host", "dims": [-1]}
    ],
    "profiles": [
        {
            "tokens": {"min": [1, 4], "opt": [4, 4], "max": [8, 4]},
            "mask": {"min": [1], "opt": [4], "max": [8]}
        },
        {
            "tokens": {"min": [9, 4], "opt": [16, 4], "max": [32, 4]},
            "mask": {"min": [9], "opt": [16], "max": [32]}
        }
    ],
    "ops": [
        {"op": "matmul", "inputs": ["tokens", "weights"], "output": "projected"},
        {"op": "add", "inputs": ["projected", "bias"], "output": "logits"},
        {"op": "identity", "inputs": ["mask"], "output": "mask_out"}
    ]
}"#;

#[test]
fn test_unknown_names_are_not_found() {
    let (logger, _) = recording_logger();
    let runtime = Runtime::new(logger);
    let engine = runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::Static).unwrap();
    let mut buffer = AlignedBuffer::new(256).unwrap();

    for name in ["nope", "hidden", "INPUT", ""] {
        assert_eq!(engine.tensor_io_mode(name), TensorIoMode::None);
        assert!(engine.tensor_shape(name).is_unknown());
        assert_eq!(engine.tensor_shape(name).nb_dims, -1);
        assert_eq!(engine.tensor_data_type(name), None);
        assert!(!context.set_tensor_address(name, buffer.as_void_ptr()));
    }
}

#[test]
fn test_io_enumeration_is_consistent() {
    let runtime = Runtime::new(Arc::new(Logger::new()));
    let engine = runtime.deserialize_engine(&pack(DYNAMIC_2IN_2OUT)).unwrap();

    let names: Vec<&str> = (0..engine.nb_io_tensors())
        .map(|i| engine.io_tensor_name(i).unwrap())
        .collect();
    assert_eq!(names, vec!["tokens", "mask", "logits", "mask_out"]);
    assert_eq!(engine.io_tensor_name(engine.nb_io_tensors()), None);
    for name in &names {
        assert_ne!(engine.tensor_io_mode(name), TensorIoMode::None);
    }
    assert_eq!(engine.tensor_io_mode("mask"), TensorIoMode::Input);
    assert_eq!(engine.tensor_io_mode("mask_out"), TensorIoMode::Output);
    assert_eq!(engine.tensor_data_type("mask_out"), Some(DataType::Int32));
    assert_eq!(engine.tensor_shape("logits").as_slice(), &[-1, 2]);
    assert_eq!(
        engine.profile_shape("tokens", 1, ProfileSelector::Opt).as_slice(),
        &[16, 4]
    );
}

#[test]
fn test_enqueue_validates_bindings() {
    let (logger, seen) = recording_logger();
    let runtime = Runtime::new(logger);
    let engine = runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::Static).unwrap();
    let stream = Stream::new().unwrap();
    let mut input = AlignedBuffer::from_f32(&[0.0; 6]).unwrap();
    let mut output = AlignedBuffer::new(24).unwrap();

    // SAFETY: buffers outlive every launch; the stream is synchronized below.
    unsafe {
        assert!(!context.enqueue(&stream));
        assert!(context.set_tensor_address("input", input.as_void_ptr()));
        assert!(!context.enqueue(&stream));
        assert_eq!(errors(&seen), 2);

        assert!(context.set_tensor_address("output", output.as_void_ptr()));
        assert!(context.enqueue(&stream));
    }
    stream.synchronize().unwrap();
}

#[test]
fn test_contexts_have_independent_bindings() {
    let runtime = Runtime::new(Arc::new(Logger::new()));
    let engine = runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap();
    let mut a = engine.create_execution_context(AllocationStrategy::Static).unwrap();
    let b = engine.create_execution_context(AllocationStrategy::Static).unwrap();
    let mut buffer = AlignedBuffer::new(24).unwrap();

    assert!(a.set_tensor_address("input", buffer.as_void_ptr()));
    assert!(a.tensor_address("input").is_some());
    assert!(b.tensor_address("input").is_none());
}

#[test]
fn test_corrupt_blob_logs_exactly_one_error() {
    let good = pack(STATIC_1IN_1OUT);
    let mut flipped = good.clone();
    let last = flipped.len() - 1;
    flipped[last] ^= 0x55;

    let corrupt: Vec<Vec<u8>> = vec![
        Vec::new(),
        good[..good.len() / 2].to_vec(),
        good[..10].to_vec(),
        flipped,
        b"GGUF\x03\x00\x00\x00 not ours".to_vec(),
    ];

    for blob in corrupt {
        let (logger, seen) = recording_logger();
        let runtime = Runtime::new(logger);
        assert!(runtime.deserialize_engine(&blob).is_none());
        assert_eq!(errors(&seen), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}

/// x[-1, -1, -1, 4] -> relu -> hidden -> relu -> y
const WIDE_4D: &str = r#"{
    "name": "wide",
    "tensors": [
        {"name": "x", "kind": "input", "dims": [-1, -1, -1, 4]},
        {"name": "hidden", "kind": "activation", "dims": [-1, -1, -1, 4]},
        {"name": "y", "kind": "output", "dims": [-1, -1, -1, 4]}
    ],
    "profiles": [
        {"x": {"min": [1, 1, 1, 4], "opt": [1, 1, 1, 4], "max": [2147483647, 2147483647, 2147483647, 4]}}
    ],
    "ops": [
        {"op": "relu", "inputs": ["x"], "output": "hidden"},
        {"op": "relu", "inputs": ["hidden"], "output": "y"}
    ]
}"#;

fn blob_of(manifest: &str) -> EngineBlob {
    EngineManifest::from_json(manifest).unwrap().into_blob().unwrap()
}

#[test]
fn test_blob_with_extreme_sizes_logs_exactly_one_error() {
    let huge_constant = |dims: Vec<i64>| {
        let mut blob = blob_of(STATIC_1IN_1OUT);
        blob.tensors.push(TensorRecord {
            name: "weights".to_string(),
            kind: TensorKind::Constant,
            dtype: DataType::Float,
            location: TensorLocation::Device,
            dims,
            data: vec![0; 16],
        });
        blob
    };

    let mut wide_profile = blob_of(DYNAMIC_2IN_2OUT);
    let tokens = wide_profile
        .tensors
        .iter()
        .position(|t| t.name == "tokens")
        .unwrap() as u32;
    for entry in &mut wide_profile.profiles[0].entries {
        if entry.tensor == tokens {
            entry.max = vec![i64::MAX / 2, 4];
        }
    }

    let blobs = vec![
        huge_constant(vec![1 << 40, 1 << 40]),
        huge_constant(vec![i64::from(i32::MAX); 4]),
        wide_profile,
        blob_of(WIDE_4D),
    ];

    for blob in blobs {
        let bytes = blob.to_bytes();
        let (logger, seen) = recording_logger();
        let runtime = Runtime::new(logger);
        assert!(runtime.deserialize_engine(&bytes).is_none());
        assert_eq!(errors(&seen), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}

#[test]
fn test_golden_run_static_strategy() {
    let runtime = Runtime::new(Arc::new(Logger::new()));
    let engine = runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::Static).unwrap();
    let stream = Stream::new().unwrap();

    let mut input = AlignedBuffer::from_f32(&[-2.0, -1.0, 0.0, 1.0, 2.0, 4.0]).unwrap();
    let mut output = AlignedBuffer::new(6 * 4).unwrap();
    assert!(context.set_tensor_address("input", input.as_void_ptr()));
    assert!(context.set_tensor_address("output", output.as_void_ptr()));

    // SAFETY: buffers outlive the synchronization below.
    unsafe {
        assert!(context.enqueue(&stream));
    }
    stream.synchronize().unwrap();

    assert_eq!(output.to_f32_vec(), vec![1.0, 1.0, 1.0, 1.5, 2.0, 3.0]);
}

#[test]
fn test_null_rebinding_unbinds() {
    let runtime = Runtime::new(Arc::new(Logger::new()));
    let engine = runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::Static).unwrap();
    let stream = Stream::new().unwrap();
    let mut input = AlignedBuffer::new(24).unwrap();
    let mut output = AlignedBuffer::new(24).unwrap();

    assert!(context.set_tensor_address("input", input.as_void_ptr()));
    assert!(context.set_tensor_address("output", output.as_void_ptr()));
    assert!(context.set_tensor_address("input", std::ptr::null_mut()));

    // SAFETY: nothing is launched when validation fails.
    unsafe {
        assert!(!context.enqueue(&stream));
    }
    assert!(stream.query());
}

#[test]
fn test_logger_replacement_mid_run() {
    let (first_logger, first) = recording_logger();
    let runtime = Runtime::new(Arc::clone(&first_logger));
    let engine = runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::Static).unwrap();

    assert!(!context.set_tensor_address("missing", std::ptr::null_mut()));
    let before = first.lock().unwrap().len();

    let second: Messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&second);
    first_logger.set_callback(move |severity, msg| {
        sink.lock().unwrap().push((severity, msg.to_string()));
    });
    assert!(!context.set_tensor_address("missing", std::ptr::null_mut()));
    assert!(runtime.deserialize_engine(b"junk").is_none());

    assert_eq!(first.lock().unwrap().len(), before);
    assert_eq!(errors(&second), 2);
}

#[test]
fn test_dynamic_shapes_and_profiles() {
    let runtime = Runtime::new(Arc::new(Logger::new()));
    let engine = runtime.deserialize_engine(&pack(DYNAMIC_2IN_2OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::OnProfileChange).unwrap();
    let stream = Stream::new().unwrap();

    let rows = 12;
    let tokens: Vec<f32> = (0..rows * 4).map(|v| v as f32).collect();
    let mut tokens_buf = AlignedBuffer::from_f32(&tokens).unwrap();
    let mut mask_buf = AlignedBuffer::from_bytes(
        &(0..rows as i32).flat_map(|v| v.to_ne_bytes()).collect::<Vec<_>>(),
    )
    .unwrap();
    let mut logits = AlignedBuffer::new(rows * 2 * 4).unwrap();
    let mut mask_out = AlignedBuffer::new(rows * 4).unwrap();

    for (name, buffer) in [
        ("tokens", &mut tokens_buf),
        ("mask", &mut mask_buf),
        ("logits", &mut logits),
        ("mask_out", &mut mask_out),
    ] {
        assert!(context.set_tensor_address(name, buffer.as_void_ptr()));
    }

    // 12 rows are outside profile 0.
    assert!(!context.set_input_shape("tokens", &Dims::new(&[rows as i64, 4]).unwrap()));
    assert!(context.set_optimization_profile(1));
    assert!(context.set_input_shape("tokens", &Dims::new(&[rows as i64, 4]).unwrap()));
    assert!(!context.all_input_dimensions_specified());

    // SAFETY: nothing is launched when validation fails.
    unsafe {
        assert!(!context.enqueue(&stream));
    }
    assert!(context.set_input_shape("mask", &Dims::new(&[rows as i64]).unwrap()));
    assert_eq!(context.tensor_shape("logits").as_slice(), &[rows as i64, 2]);

    // SAFETY: buffers outlive the synchronization below.
    unsafe {
        assert!(context.enqueue(&stream));
    }
    stream.synchronize().unwrap();

    // weights pick columns 0 + 2 and 1 + 3.
    let expected: Vec<f32> = (0..rows)
        .flat_map(|r| {
            let row = &tokens[r * 4..r * 4 + 4];
            [row[0] + row[2] + 0.5, row[1] + row[3] - 0.5]
        })
        .collect();
    assert_eq!(logits.to_f32_vec(), expected);
    assert_eq!(mask_out.as_bytes(), mask_buf.as_bytes());
}

#[test]
fn test_user_managed_memory() {
    let runtime = Runtime::new(Arc::new(Logger::new()));
    let engine = runtime.deserialize_engine(&pack(DYNAMIC_2IN_2OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::UserManaged).unwrap();
    let stream = Stream::new().unwrap();

    let mut tokens = AlignedBuffer::from_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    let mut mask = AlignedBuffer::new(4).unwrap();
    let mut logits = AlignedBuffer::new(8).unwrap();
    let mut mask_out = AlignedBuffer::new(4).unwrap();
    context.set_tensor_address("tokens", tokens.as_void_ptr());
    context.set_tensor_address("mask", mask.as_void_ptr());
    context.set_tensor_address("logits", logits.as_void_ptr());
    context.set_tensor_address("mask_out", mask_out.as_void_ptr());
    context.set_input_shape("tokens", &Dims::new(&[1, 4]).unwrap());
    context.set_input_shape("mask", &Dims::new(&[1]).unwrap());

    // SAFETY: nothing is launched when validation fails.
    unsafe {
        assert!(!context.enqueue(&stream));
    }

    let mut scratch = AlignedBuffer::new(engine.device_memory_size()).unwrap();
    assert!(context.set_device_memory(scratch.as_void_ptr(), scratch.len()));
    // SAFETY: all buffers outlive the synchronization below.
    unsafe {
        assert!(context.enqueue(&stream));
    }
    stream.synchronize().unwrap();
    assert_eq!(logits.to_f32_vec(), vec![4.5, 5.5]);
}

#[test]
fn test_concurrent_contexts_on_separate_streams() {
    let runtime = Runtime::new(Arc::new(Logger::new()));
    let engine = Arc::new(runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut context = engine.create_execution_context(AllocationStrategy::Static).unwrap();
                let stream = Stream::new().unwrap();
                let value = worker as f32;
                let mut input = AlignedBuffer::from_f32(&[value; 6]).unwrap();
                let mut output = AlignedBuffer::new(24).unwrap();
                context.set_tensor_address("input", input.as_void_ptr());
                context.set_tensor_address("output", output.as_void_ptr());

                for _ in 0..16 {
                    // SAFETY: buffers outlive the synchronization below.
                    unsafe {
                        assert!(context.enqueue(&stream));
                    }
                }
                stream.synchronize().unwrap();
                output.to_f32_vec()
            })
        })
        .collect();

    for (worker, handle) in handles.into_iter().enumerate() {
        let expected = worker as f32 * 0.5 + 1.0;
        assert_eq!(handle.join().unwrap(), vec![expected; 6]);
    }
}

#[test]
fn test_error_recorder_receives_context_errors() {
    let mut runtime = Runtime::new(Arc::new(Logger::new()));
    let log = Arc::new(ErrorLog::default());
    runtime.set_error_recorder(Some(log.clone()));
    let engine = runtime.deserialize_engine(&pack(STATIC_1IN_1OUT)).unwrap();
    let mut context = engine.create_execution_context(AllocationStrategy::Static).unwrap();

    assert!(!context.set_tensor_address("unknown", std::ptr::null_mut()));
    assert!(!context.set_optimization_profile(3));

    assert_eq!(log.nb_errors(), 2);
    assert_eq!(log.get(0).map(|(code, _)| code), Some(ErrorCode::InvalidArgument));
}
