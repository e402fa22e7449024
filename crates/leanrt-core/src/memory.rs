//! Aligned host memory and bound tensor addresses.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

/// Alignment required for every bound tensor address.
pub const TENSOR_ALIGNMENT: usize = 256;

/// Whether `ptr` meets `TENSOR_ALIGNMENT`.
pub fn is_aligned(ptr: *const c_void) -> bool {
    (ptr as usize) % TENSOR_ALIGNMENT == 0
}

/// Round `size` up to the next multiple of `TENSOR_ALIGNMENT`, or `None` if
/// the result does not fit in `usize`.
pub fn align_up(size: usize) -> Option<usize> {
    size.div_ceil(TENSOR_ALIGNMENT).checked_mul(TENSOR_ALIGNMENT)
}

/// Zero-initialized host allocation aligned to `TENSOR_ALIGNMENT`.
///
/// Used for engine constants, runtime-owned activation memory, and by
/// callers that need suitably aligned IO buffers.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer exclusively owns its heap block; shared access only
// hands out `&[u8]`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes. Returns `None` if the allocation fails.
    pub fn new(len: usize) -> Option<Self> {
        if len == 0 {
            // Aligned dangling pointer, never dereferenced for a zero length.
            let ptr = NonNull::new(TENSOR_ALIGNMENT as *mut u8)?;
            return Some(Self { ptr, len });
        }
        let layout = Layout::from_size_align(len, TENSOR_ALIGNMENT).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, len })
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut buffer = Self::new(bytes.len())?;
        buffer.as_bytes_mut().copy_from_slice(bytes);
        Some(buffer)
    }

    /// Allocate a buffer holding `values` in native byte order.
    pub fn from_f32(values: &[f32]) -> Option<Self> {
        let mut buffer = Self::new(std::mem::size_of_val(values))?;
        buffer.write_f32(values);
        Some(buffer)
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable base address.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Writable base address for kernels. Callers order writes through the
    /// stream; the buffer itself does no synchronization.
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Base address for `set_tensor_address`.
    pub fn as_void_ptr(&mut self) -> *mut c_void {
        self.ptr.as_ptr().cast()
    }

    /// Contents as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes (or dangling with len 0).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Contents as mutable bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy `values` to the start of the buffer. Extra values are ignored.
    pub fn write_f32(&mut self, values: &[f32]) {
        for (chunk, value) in self.as_bytes_mut().chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
    }

    /// Read the buffer as `f32` values.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.as_bytes()
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(self.len, TENSOR_ALIGNMENT) {
            // SAFETY: allocated in `new` with this exact layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Caller-owned address bound to a tensor.
///
/// The runtime stores the address and hands it to kernels; it never reads,
/// frees or checks the size of the memory behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TensorAddress(NonNull<c_void>);

// SAFETY: only the address value crosses threads; dereferencing it is
// governed by the unsafe contract of `ExecutionContext::enqueue`.
unsafe impl Send for TensorAddress {}

impl TensorAddress {
    pub(crate) fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub(crate) fn get(self) -> NonNull<c_void> {
        self.0
    }

    pub(crate) fn as_bytes_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_aligned_and_zeroed() {
        let mut buffer = AlignedBuffer::new(1000).unwrap();
        assert!(is_aligned(buffer.as_void_ptr()));
        assert_eq!(buffer.len(), 1000);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_buffer() {
        let mut buffer = AlignedBuffer::new(0).unwrap();
        assert!(buffer.is_empty());
        assert!(is_aligned(buffer.as_void_ptr()));
        assert!(buffer.as_bytes().is_empty());
    }

    #[test]
    fn test_f32_round_trip() {
        let buffer = AlignedBuffer::from_f32(&[1.5, -2.0, 3.25]).unwrap();
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer.to_f32_vec(), vec![1.5, -2.0, 3.25]);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(256));
        assert_eq!(align_up(256), Some(256));
        assert_eq!(align_up(257), Some(512));
        assert_eq!(align_up(usize::MAX), None);
    }

    #[test]
    fn test_tensor_address_rejects_null() {
        assert!(TensorAddress::new(std::ptr::null_mut()).is_none());
    }
}
