//! Op set and shape inference.

use serde::{Deserialize, Serialize};

use crate::{DataType, KernelError, Result};

/// Dimension value meaning "not known until runtime".
pub const WILDCARD: i64 = -1;

/// One operation of an engine plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    /// Copy the input unchanged. Works for every data type.
    Identity,
    /// `max(x, 0)`.
    Relu,
    /// `1 / (1 + exp(-x))`.
    Sigmoid,
    /// `x * scale + shift`.
    Scale {
        scale: f32,
        #[serde(default)]
        shift: f32,
    },
    /// Elementwise sum with broadcasting.
    Add,
    /// Elementwise product with broadcasting.
    Mul,
    /// Rank-2 matrix product.
    #[serde(rename = "matmul")]
    MatMul,
}

impl OpKind {
    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Identity => "identity",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Scale { .. } => "scale",
            OpKind::Add => "add",
            OpKind::Mul => "mul",
            OpKind::MatMul => "matmul",
        }
    }

    /// Blob code of the op. Attributes are stored separately.
    pub fn code(&self) -> u8 {
        match self {
            OpKind::Identity => 0,
            OpKind::Relu => 1,
            OpKind::Sigmoid => 2,
            OpKind::Scale { .. } => 3,
            OpKind::Add => 4,
            OpKind::Mul => 5,
            OpKind::MatMul => 6,
        }
    }

    /// Rebuild an op from its blob code and attribute list.
    pub fn from_code(code: u8, attrs: &[f32]) -> Option<Self> {
        let op = match (code, attrs) {
            (0, []) => OpKind::Identity,
            (1, []) => OpKind::Relu,
            (2, []) => OpKind::Sigmoid,
            (3, [scale, shift]) => OpKind::Scale {
                scale: *scale,
                shift: *shift,
            },
            (4, []) => OpKind::Add,
            (5, []) => OpKind::Mul,
            (6, []) => OpKind::MatMul,
            _ => return None,
        };
        Some(op)
    }

    /// Attribute values stored next to the op code.
    pub fn attrs(&self) -> Vec<f32> {
        match self {
            OpKind::Scale { scale, shift } => vec![*scale, *shift],
            _ => Vec::new(),
        }
    }

    /// Number of inputs the op consumes.
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Identity | OpKind::Relu | OpKind::Sigmoid | OpKind::Scale { .. } => 1,
            OpKind::Add | OpKind::Mul | OpKind::MatMul => 2,
        }
    }

    /// Check operand element types and return the output element type.
    pub fn output_dtype(&self, inputs: &[DataType]) -> Result<DataType> {
        self.check_arity(inputs.len())?;
        let first = inputs[0];
        if !matches!(self, OpKind::Identity) && first != DataType::Float {
            return Err(KernelError::UnsupportedDataType {
                op: self.name(),
                dtype: first,
            });
        }
        if let Some(&second) = inputs.get(1) {
            if second != first {
                return Err(KernelError::MixedDataTypes {
                    op: self.name(),
                    left: first,
                    right: second,
                });
            }
        }
        Ok(first)
    }

    fn check_arity(&self, actual: usize) -> Result<()> {
        if actual != self.arity() {
            return Err(KernelError::Arity {
                op: self.name(),
                expected: self.arity(),
                actual,
            });
        }
        Ok(())
    }
}

/// Infer the output dims of `op` from its input dims.
///
/// Wildcard dimensions propagate: an output dimension is `WILDCARD` whenever
/// it cannot be decided from the known input dimensions.
pub fn infer_output_dims(op: &OpKind, inputs: &[&[i64]]) -> Result<Vec<i64>> {
    op.check_arity(inputs.len())?;
    match op {
        OpKind::Identity | OpKind::Relu | OpKind::Sigmoid | OpKind::Scale { .. } => {
            Ok(inputs[0].to_vec())
        }
        OpKind::Add | OpKind::Mul => broadcast_dims(op.name(), inputs[0], inputs[1]),
        OpKind::MatMul => {
            let (a, b) = (inputs[0], inputs[1]);
            if a.len() != 2 || b.len() != 2 {
                return Err(KernelError::ShapeMismatch {
                    op: op.name(),
                    reason: format!("operands must be rank 2, got ranks {} and {}", a.len(), b.len()),
                });
            }
            if a[1] != WILDCARD && b[0] != WILDCARD && a[1] != b[0] {
                return Err(KernelError::ShapeMismatch {
                    op: op.name(),
                    reason: format!("inner dimensions differ ({} vs {})", a[1], b[0]),
                });
            }
            Ok(vec![a[0], b[1]])
        }
    }
}

/// Numpy-style broadcast of two shapes, aligned from the trailing dimension.
pub fn broadcast_dims(op: &'static str, left: &[i64], right: &[i64]) -> Result<Vec<i64>> {
    let rank = left.len().max(right.len());
    let mut out = vec![0; rank];

    for i in 0..rank {
        let l = dim_from_end(left, i);
        let r = dim_from_end(right, i);
        out[rank - 1 - i] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            // A wildcard broadcasts against a known size n > 1 only as 1 or n.
            (WILDCARD, b) => b,
            (a, WILDCARD) => a,
            (a, b) => {
                return Err(KernelError::ShapeMismatch {
                    op,
                    reason: format!("cannot broadcast {:?} with {:?} ({} vs {})", left, right, a, b),
                });
            }
        };
    }

    Ok(out)
}

fn dim_from_end(dims: &[i64], i: usize) -> i64 {
    if i < dims.len() { dims[dims.len() - 1 - i] } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unary_keeps_dims() {
        let dims = infer_output_dims(&OpKind::Relu, &[&[2, -1, 4]]).unwrap();
        assert_eq!(dims, vec![2, -1, 4]);
    }

    #[test]
    fn test_broadcast_known_dims() {
        assert_eq!(broadcast_dims("add", &[4, 1, 3], &[5, 1]).unwrap(), vec![4, 5, 3]);
        assert!(broadcast_dims("add", &[2, 3], &[4, 3]).is_err());
    }

    #[test]
    fn test_broadcast_wildcards() {
        assert_eq!(broadcast_dims("add", &[-1, 3], &[1, 3]).unwrap(), vec![-1, 3]);
        assert_eq!(broadcast_dims("add", &[-1, 3], &[8, 3]).unwrap(), vec![8, 3]);
        assert_eq!(broadcast_dims("mul", &[-1], &[-1]).unwrap(), vec![-1]);
    }

    #[test]
    fn test_matmul_dims() {
        assert_eq!(infer_output_dims(&OpKind::MatMul, &[&[-1, 4], &[4, 2]]).unwrap(), vec![-1, 2]);
        assert!(infer_output_dims(&OpKind::MatMul, &[&[3, 4], &[5, 2]]).is_err());
        assert!(infer_output_dims(&OpKind::MatMul, &[&[3, 4, 1], &[4, 2]]).is_err());
    }

    #[test]
    fn test_arity_is_checked() {
        let err = infer_output_dims(&OpKind::Add, &[&[1]]).unwrap_err();
        assert_eq!(
            err,
            KernelError::Arity {
                op: "add",
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_output_dtype_rules() {
        assert_eq!(
            OpKind::Identity.output_dtype(&[DataType::Int64]).unwrap(),
            DataType::Int64
        );
        assert!(OpKind::Relu.output_dtype(&[DataType::Int32]).is_err());
        assert!(OpKind::Add.output_dtype(&[DataType::Float, DataType::Half]).is_err());
    }

    #[test]
    fn test_codes_round_trip_with_attrs() {
        let ops = [
            OpKind::Identity,
            OpKind::Relu,
            OpKind::Sigmoid,
            OpKind::Scale { scale: 2.0, shift: -1.0 },
            OpKind::Add,
            OpKind::Mul,
            OpKind::MatMul,
        ];
        for op in ops {
            assert_eq!(OpKind::from_code(op.code(), &op.attrs()), Some(op));
        }
        assert_eq!(OpKind::from_code(3, &[1.0]), None);
        assert_eq!(OpKind::from_code(42, &[]), None);
    }

    #[test]
    fn test_serde_tagging() {
        let op: OpKind = serde_json::from_str(r#"{"op":"scale","scale":0.5}"#).unwrap();
        assert_eq!(op, OpKind::Scale { scale: 0.5, shift: 0.0 });
        let op: OpKind = serde_json::from_str(r#"{"op":"matmul"}"#).unwrap();
        assert_eq!(op, OpKind::MatMul);
    }
}
