//! Reference CPU backend built on ndarray.

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayViewD, ArrayViewMutD, Ix2, IxDyn, Zip};
use tracing::trace;

use crate::error::KernelError;
use crate::op::infer_output_dims;
use crate::{DataType, KernelBackend, OpKind, Result, TensorView, TensorViewMut};

/// Backend running every op on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    /// Create a new CPU backend.
    pub fn new() -> Self {
        Self
    }
}

impl KernelBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn supports(&self, op: &OpKind, dtype: DataType) -> bool {
        op.output_dtype(&vec![dtype; op.arity()]).is_ok()
    }

    unsafe fn launch(
        &self,
        op: &OpKind,
        inputs: &[TensorView<'_>],
        output: TensorViewMut<'_>,
    ) -> Result<()> {
        let dtypes: Vec<DataType> = inputs.iter().map(|t| t.dtype).collect();
        let dtype = op.output_dtype(&dtypes)?;
        if output.dtype != dtype {
            return Err(KernelError::MixedDataTypes {
                op: op.name(),
                left: dtype,
                right: output.dtype,
            });
        }
        check_output_dims(op, inputs, &output)?;

        trace!("Launching {} on {:?}", op.name(), output.dims);

        match *op {
            OpKind::Identity => unsafe { copy(&inputs[0], output) },
            OpKind::Relu => unsafe { unary(&inputs[0], output, |x| x.max(0.0)) },
            OpKind::Sigmoid => unsafe { unary(&inputs[0], output, |x| 1.0 / (1.0 + (-x).exp())) },
            OpKind::Scale { scale, shift } => unsafe {
                unary(&inputs[0], output, move |x| x * scale + shift)
            },
            OpKind::Add => unsafe { binary(op, &inputs[0], &inputs[1], output, |a, b| a + b) },
            OpKind::Mul => unsafe { binary(op, &inputs[0], &inputs[1], output, |a, b| a * b) },
            OpKind::MatMul => unsafe { matmul(&inputs[0], &inputs[1], output) },
        }
    }
}

fn check_output_dims(op: &OpKind, inputs: &[TensorView<'_>], output: &TensorViewMut<'_>) -> Result<()> {
    let input_dims: Vec<Vec<i64>> = inputs
        .iter()
        .map(|t| t.dims.iter().map(|&d| d as i64).collect())
        .collect();
    let refs: Vec<&[i64]> = input_dims.iter().map(Vec::as_slice).collect();
    let expected = infer_output_dims(op, &refs)?;
    let actual: Vec<i64> = output.dims.iter().map(|&d| d as i64).collect();

    if expected != actual {
        return Err(KernelError::ShapeMismatch {
            op: op.name(),
            reason: format!("output is {:?}, operands produce {:?}", actual, expected),
        });
    }
    Ok(())
}

unsafe fn view_f32<'a>(tensor: &TensorView<'a>) -> ArrayViewD<'a, f32> {
    unsafe { ArrayViewD::from_shape_ptr(IxDyn(tensor.dims), tensor.data as *const f32) }
}

unsafe fn view_f32_mut<'a>(tensor: TensorViewMut<'a>) -> ArrayViewMutD<'a, f32> {
    unsafe { ArrayViewMutD::from_shape_ptr(IxDyn(tensor.dims), tensor.data as *mut f32) }
}

unsafe fn copy(input: &TensorView<'_>, output: TensorViewMut<'_>) -> Result<()> {
    let (Some(len), Some(out_len)) = (input.byte_len(), output.byte_len()) else {
        return Err(KernelError::Execution("tensor size overflows usize".to_string()));
    };
    if len != out_len {
        return Err(KernelError::ShapeMismatch {
            op: "identity",
            reason: format!("copying {} bytes into {} bytes", len, out_len),
        });
    }
    unsafe { std::ptr::copy_nonoverlapping(input.data, output.data, len) };
    Ok(())
}

unsafe fn unary<F>(input: &TensorView<'_>, output: TensorViewMut<'_>, f: F) -> Result<()>
where
    F: Fn(f32) -> f32,
{
    let src = unsafe { view_f32(input) };
    let mut dst = unsafe { view_f32_mut(output) };
    Zip::from(&mut dst).and(&src).for_each(|o, &x| *o = f(x));
    Ok(())
}

unsafe fn binary<F>(
    op: &OpKind,
    left: &TensorView<'_>,
    right: &TensorView<'_>,
    output: TensorViewMut<'_>,
    f: F,
) -> Result<()>
where
    F: Fn(f32, f32) -> f32,
{
    let a = unsafe { view_f32(left) };
    let b = unsafe { view_f32(right) };
    let mut dst = unsafe { view_f32_mut(output) };

    let shape = dst.raw_dim();
    let (Some(a), Some(b)) = (a.broadcast(shape.clone()), b.broadcast(shape)) else {
        return Err(KernelError::ShapeMismatch {
            op: op.name(),
            reason: format!("operands {:?} and {:?} do not broadcast to {:?}", left.dims, right.dims, dst.shape()),
        });
    };

    Zip::from(&mut dst)
        .and(&a)
        .and(&b)
        .for_each(|o, &x, &y| *o = f(x, y));
    Ok(())
}

unsafe fn matmul(left: &TensorView<'_>, right: &TensorView<'_>, output: TensorViewMut<'_>) -> Result<()> {
    let to_2d = |e: ndarray::ShapeError| KernelError::Execution(e.to_string());

    let a = unsafe { view_f32(left) }.into_dimensionality::<Ix2>().map_err(to_2d)?;
    let b = unsafe { view_f32(right) }.into_dimensionality::<Ix2>().map_err(to_2d)?;
    let mut c = unsafe { view_f32_mut(output) }
        .into_dimensionality::<Ix2>()
        .map_err(to_2d)?;

    c.fill(0.0);
    general_mat_mul(1.0, &a, &b, 0.0, &mut c);
    Ok(())
}
