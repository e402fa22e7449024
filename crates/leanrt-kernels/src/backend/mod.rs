//! Kernel backend implementations.

#[cfg(feature = "cpu")]
pub mod cpu;

use crate::{DataType, OpKind, Result, TensorView, TensorViewMut};

/// Trait for kernel backends.
///
/// An engine plan is a list of ops; the runtime resolves every operand to a
/// raw address and hands each op to the backend in plan order, on the
/// stream's worker thread.
pub trait KernelBackend: Send + Sync {
    /// Backend name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Whether the backend can run `op` over elements of `dtype`.
    fn supports(&self, op: &OpKind, dtype: DataType) -> bool;

    /// Run one op.
    ///
    /// # Arguments
    /// * `inputs` - Operand views, in op order
    /// * `output` - Destination view, already shaped
    ///
    /// # Safety
    /// Every view must point to live memory of at least `byte_len()` bytes,
    /// aligned for its element type, and the output must not overlap any
    /// input for the duration of the call.
    unsafe fn launch(
        &self,
        op: &OpKind,
        inputs: &[TensorView<'_>],
        output: TensorViewMut<'_>,
    ) -> Result<()>;
}
