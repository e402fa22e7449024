//! Blob decoder.

use leanrt_kernels::{DataType, OpKind};

use super::{
    BLOB_MAGIC, BLOB_VERSION, DecodeOptions, EngineBlob, HEADER_SIZE, OpRecord, ProfileEntry,
    ProfileRecord, TensorKind, TensorLocation, TensorRecord, checksum,
};
use crate::error::BlobError;

pub(super) fn decode(bytes: &[u8], options: &DecodeOptions) -> Result<EngineBlob, BlobError> {
    if bytes.len() as u64 > options.max_size {
        return Err(BlobError::TooLarge {
            size: bytes.len() as u64,
            limit: options.max_size,
        });
    }
    if bytes.len() < HEADER_SIZE {
        return Err(BlobError::TooShort(bytes.len()));
    }

    let mut header = Cursor::new(&bytes[..HEADER_SIZE], 0);
    if header.take(4)? != BLOB_MAGIC {
        return Err(BlobError::BadMagic);
    }
    let version = header.u32()?;
    if version != BLOB_VERSION {
        return Err(BlobError::UnsupportedVersion {
            found: version,
            supported: BLOB_VERSION,
        });
    }
    let _flags = header.u32()?;
    let declared = header.u64()?;
    let expected = header.u32()?;

    let payload = &bytes[HEADER_SIZE..];
    if declared != payload.len() as u64 {
        return Err(BlobError::LengthMismatch {
            declared,
            actual: payload.len() as u64,
        });
    }
    if options.verify_checksum {
        let actual = checksum(payload);
        if actual != expected {
            return Err(BlobError::ChecksumMismatch { expected, actual });
        }
    }

    let mut r = Cursor::new(payload, HEADER_SIZE);
    let name = r.string()?;

    let n_tensors = r.u32()? as usize;
    let mut tensors = Vec::with_capacity(r.capacity_hint(n_tensors));
    for _ in 0..n_tensors {
        tensors.push(read_tensor(&mut r)?);
    }

    let n_profiles = r.u32()? as usize;
    let mut profiles = Vec::with_capacity(r.capacity_hint(n_profiles));
    for _ in 0..n_profiles {
        let n_entries = r.u32()? as usize;
        let mut entries = Vec::with_capacity(r.capacity_hint(n_entries));
        for _ in 0..n_entries {
            let tensor = r.u32()?;
            let rank = r.u8()? as usize;
            entries.push(ProfileEntry {
                tensor,
                min: r.dims(rank)?,
                opt: r.dims(rank)?,
                max: r.dims(rank)?,
            });
        }
        profiles.push(ProfileRecord { entries });
    }

    let n_ops = r.u32()? as usize;
    let mut ops = Vec::with_capacity(r.capacity_hint(n_ops));
    for index in 0..n_ops {
        ops.push(read_op(&mut r, index)?);
    }

    if r.remaining() > 0 {
        return Err(BlobError::TrailingBytes(r.remaining()));
    }

    Ok(EngineBlob {
        name,
        tensors,
        profiles,
        ops,
    })
}

fn read_tensor(r: &mut Cursor<'_>) -> Result<TensorRecord, BlobError> {
    let name = r.string()?;
    let invalid = |reason: String| BlobError::InvalidTensor {
        name: name.clone(),
        reason,
    };

    let kind_code = r.u8()?;
    let kind = TensorKind::from_code(kind_code)
        .ok_or_else(|| invalid(format!("unknown tensor kind {}", kind_code)))?;
    let dtype_code = r.u8()?;
    let dtype = DataType::from_code(i32::from(dtype_code))
        .ok_or_else(|| invalid(format!("unknown data type {}", dtype_code)))?;
    let location_code = r.u8()?;
    let location = TensorLocation::from_code(location_code)
        .ok_or_else(|| invalid(format!("unknown location {}", location_code)))?;

    let rank = r.u8()? as usize;
    let dims = r.dims(rank)?;
    let data_len = r.u64()?;
    let data_len = usize::try_from(data_len).map_err(|_| BlobError::Truncated {
        offset: r.offset(),
        needed: usize::MAX,
    })?;
    let data = r.take(data_len)?.to_vec();

    Ok(TensorRecord {
        name,
        kind,
        dtype,
        location,
        dims,
        data,
    })
}

fn read_op(r: &mut Cursor<'_>, index: usize) -> Result<OpRecord, BlobError> {
    let code = r.u8()?;
    let n_attrs = r.u8()? as usize;
    let mut attrs = Vec::with_capacity(n_attrs);
    for _ in 0..n_attrs {
        attrs.push(r.f32()?);
    }
    let op = OpKind::from_code(code, &attrs).ok_or_else(|| BlobError::InvalidOp {
        index,
        reason: format!("unknown op code {} with {} attributes", code, n_attrs),
    })?;

    let n_inputs = r.u8()? as usize;
    let mut inputs = Vec::with_capacity(n_inputs);
    for _ in 0..n_inputs {
        inputs.push(r.u32()?);
    }
    let output = r.u32()?;

    Ok(OpRecord { op, inputs, output })
}

/// Little-endian reader over a byte slice.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Offset of `bytes` within the whole blob, for error messages.
    base: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], base: usize) -> Self {
        Self { bytes, pos: 0, base }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Clamp a declared element count so a corrupt count cannot force a
    /// huge allocation before the reads fail.
    fn capacity_hint(&self, count: usize) -> usize {
        count.min(self.remaining())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BlobError> {
        if n > self.remaining() {
            return Err(BlobError::Truncated {
                offset: self.offset(),
                needed: n,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BlobError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BlobError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, BlobError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, BlobError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, BlobError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, BlobError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn dims(&mut self, rank: usize) -> Result<Vec<i64>, BlobError> {
        (0..rank).map(|_| self.i64()).collect()
    }

    fn string(&mut self) -> Result<String, BlobError> {
        let len = self.u32()? as usize;
        let at = self.offset();
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BlobError::InvalidString(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::tests::sample_blob;
    use pretty_assertions::assert_eq;

    fn decode_default(bytes: &[u8]) -> Result<EngineBlob, BlobError> {
        decode(bytes, &DecodeOptions::default())
    }

    #[test]
    fn test_rejects_short_and_empty() {
        assert_eq!(decode_default(&[]), Err(BlobError::TooShort(0)));
        assert_eq!(decode_default(b"LRTE"), Err(BlobError::TooShort(4)));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample_blob().to_bytes();
        bytes[0] = b'X';
        assert_eq!(decode_default(&bytes), Err(BlobError::BadMagic));
    }

    #[test]
    fn test_rejects_other_version() {
        let mut bytes = sample_blob().to_bytes();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            decode_default(&bytes),
            Err(BlobError::UnsupportedVersion {
                found: 7,
                supported: BLOB_VERSION
            })
        );
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = sample_blob().to_bytes();
        let err = decode_default(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, BlobError::LengthMismatch { .. }));
    }

    #[test]
    fn test_detects_corruption_by_checksum() {
        let mut bytes = sample_blob().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            decode_default(&bytes),
            Err(BlobError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_can_be_skipped() {
        let mut bytes = sample_blob().to_bytes();
        bytes[20..24].copy_from_slice(&0u32.to_le_bytes());
        let options = DecodeOptions {
            verify_checksum: false,
            ..DecodeOptions::default()
        };
        assert_eq!(decode(&bytes, &options).unwrap(), sample_blob());
    }

    #[test]
    fn test_size_limit() {
        let bytes = sample_blob().to_bytes();
        let options = DecodeOptions {
            max_size: 16,
            verify_checksum: true,
        };
        assert_eq!(
            decode(&bytes, &options),
            Err(BlobError::TooLarge {
                size: bytes.len() as u64,
                limit: 16
            })
        );
    }

    #[test]
    fn test_huge_count_fails_without_allocating() {
        // Name, then a tensor count far beyond the payload.
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        let bytes = with_header(&payload);

        assert!(matches!(
            decode_default(&bytes),
            Err(BlobError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut payload = sample_blob().to_bytes()[HEADER_SIZE..].to_vec();
        payload.extend_from_slice(&[0, 0]);
        assert_eq!(decode_default(&with_header(&payload)), Err(BlobError::TrailingBytes(2)));
    }

    fn with_header(payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(BLOB_MAGIC);
        bytes.extend_from_slice(&BLOB_VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&checksum(payload).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }
}
