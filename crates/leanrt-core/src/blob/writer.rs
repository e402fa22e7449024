//! Blob encoder.

use super::{BLOB_MAGIC, BLOB_VERSION, EngineBlob, HEADER_SIZE, TensorRecord, checksum};

pub(super) fn encode(blob: &EngineBlob) -> Vec<u8> {
    let mut payload = Vec::new();
    put_string(&mut payload, &blob.name);

    put_u32(&mut payload, blob.tensors.len() as u32);
    for tensor in &blob.tensors {
        put_tensor(&mut payload, tensor);
    }

    put_u32(&mut payload, blob.profiles.len() as u32);
    for profile in &blob.profiles {
        put_u32(&mut payload, profile.entries.len() as u32);
        for entry in &profile.entries {
            put_u32(&mut payload, entry.tensor);
            payload.push(entry.min.len() as u8);
            for dims in [&entry.min, &entry.opt, &entry.max] {
                put_dims(&mut payload, dims);
            }
        }
    }

    put_u32(&mut payload, blob.ops.len() as u32);
    for op in &blob.ops {
        payload.push(op.op.code());
        let attrs = op.op.attrs();
        payload.push(attrs.len() as u8);
        for attr in attrs {
            payload.extend_from_slice(&attr.to_le_bytes());
        }
        payload.push(op.inputs.len() as u8);
        for &input in &op.inputs {
            put_u32(&mut payload, input);
        }
        put_u32(&mut payload, op.output);
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(BLOB_MAGIC);
    put_u32(&mut bytes, BLOB_VERSION);
    put_u32(&mut bytes, 0);
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    put_u32(&mut bytes, checksum(&payload));
    bytes.extend_from_slice(&payload);
    bytes
}

fn put_tensor(out: &mut Vec<u8>, tensor: &TensorRecord) {
    put_string(out, &tensor.name);
    out.push(tensor.kind.code());
    out.push(tensor.dtype.code() as u8);
    out.push(tensor.location as i32 as u8);
    out.push(tensor.dims.len() as u8);
    put_dims(out, &tensor.dims);
    out.extend_from_slice(&(tensor.data.len() as u64).to_le_bytes());
    out.extend_from_slice(&tensor.data);
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_dims(out: &mut Vec<u8>, dims: &[i64]) {
    for d in dims {
        out.extend_from_slice(&d.to_le_bytes());
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}
