//! Validated execution plan built from a decoded engine blob.

use std::collections::HashMap;

use leanrt_kernels::{
    DataType, KernelBackend, OpKind, WILDCARD, byte_size, element_count, infer_output_dims,
};

use crate::blob::{EngineBlob, MAX_NAME_LEN, TensorKind, TensorLocation};
use crate::dims::MAX_DIMS;
use crate::engine::{ProfileSelector, TensorIoMode};
use crate::error::{BindingError, BlobError};
use crate::memory::align_up;

/// Largest extent accepted for a single dimension.
pub(crate) const MAX_DIM_EXTENT: i64 = i32::MAX as i64;

/// A tensor of the plan, with engine-level dims.
#[derive(Debug, Clone)]
pub(crate) struct TensorInfo {
    pub(crate) name: String,
    pub(crate) kind: TensorKind,
    pub(crate) dtype: DataType,
    pub(crate) location: TensorLocation,
    /// Declared dims refined by profile pinning and shape inference.
    pub(crate) dims: Vec<i64>,
}

impl TensorInfo {
    pub(crate) fn io_mode(&self) -> TensorIoMode {
        match self.kind {
            TensorKind::Input => TensorIoMode::Input,
            TensorKind::Output => TensorIoMode::Output,
            TensorKind::Activation | TensorKind::Constant => TensorIoMode::None,
        }
    }

    pub(crate) fn is_io(&self) -> bool {
        self.io_mode() != TensorIoMode::None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ShapeRange {
    pub(crate) min: Vec<i64>,
    pub(crate) opt: Vec<i64>,
    pub(crate) max: Vec<i64>,
}

impl ShapeRange {
    fn get(&self, selector: ProfileSelector) -> &[i64] {
        match selector {
            ProfileSelector::Min => &self.min,
            ProfileSelector::Opt => &self.opt,
            ProfileSelector::Max => &self.max,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub(crate) op: OpKind,
    pub(crate) inputs: Vec<usize>,
    pub(crate) output: usize,
}

/// Concrete shapes and activation offsets for one launch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LaunchLayout {
    pub(crate) dims: Vec<Vec<usize>>,
    /// Byte offset of each activation inside the activation memory.
    pub(crate) offsets: Vec<Option<usize>>,
    pub(crate) activation_bytes: usize,
}

#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) name: String,
    pub(crate) tensors: Vec<TensorInfo>,
    index: HashMap<String, usize>,
    /// IO tensor indices in blob order.
    pub(crate) io: Vec<usize>,
    /// One map per profile, keyed by input tensor index.
    profiles: Vec<HashMap<usize, ShapeRange>>,
    pub(crate) steps: Vec<Step>,
    activation_sizes: Vec<usize>,
    /// Last step reading an engine input.
    pub(crate) last_input_reader: Option<usize>,
}

/// Constant payloads split off the blob, keyed by tensor index.
pub(crate) type ConstantData = Vec<(usize, Vec<u8>)>;

impl Plan {
    /// Validate `blob` and build the plan.
    pub(crate) fn build(
        blob: EngineBlob,
        backend: &dyn KernelBackend,
    ) -> Result<(Self, ConstantData), BlobError> {
        let mut tensors = Vec::with_capacity(blob.tensors.len());
        let mut index = HashMap::with_capacity(blob.tensors.len());
        let mut constants = Vec::new();

        for (i, record) in blob.tensors.into_iter().enumerate() {
            let invalid = |reason: String| BlobError::InvalidTensor {
                name: record.name.clone(),
                reason,
            };
            if record.name.is_empty() {
                return Err(invalid("empty name".to_string()));
            }
            if record.name.len() > MAX_NAME_LEN || record.name.contains('\0') {
                return Err(invalid(format!(
                    "name must be at most {} bytes without NUL characters",
                    MAX_NAME_LEN
                )));
            }
            if record.dims.len() > MAX_DIMS {
                return Err(invalid(format!("rank {} exceeds {}", record.dims.len(), MAX_DIMS)));
            }
            if record.dims.iter().any(|&d| d < WILDCARD) {
                return Err(invalid(format!("negative dimension in {:?}", record.dims)));
            }
            if record.dims.iter().any(|&d| d > MAX_DIM_EXTENT) {
                return Err(invalid(format!(
                    "dimension in {:?} exceeds {}",
                    record.dims, MAX_DIM_EXTENT
                )));
            }

            if record.kind == TensorKind::Constant {
                if record.dims.contains(&WILDCARD) {
                    return Err(invalid("constants cannot have wildcard dimensions".to_string()));
                }
                let sizes: Vec<usize> = record.dims.iter().map(|&d| d as usize).collect();
                let expected = element_count(&sizes)
                    .and_then(|volume| byte_size(record.dtype, volume))
                    .ok_or_else(|| invalid(format!("size of shape {:?} overflows", record.dims)))?;
                if record.data.len() != expected {
                    return Err(invalid(format!(
                        "holds {} bytes of data, shape needs {}",
                        record.data.len(),
                        expected
                    )));
                }
                constants.push((i, record.data));
            } else if !record.data.is_empty() {
                return Err(invalid("only constants carry data".to_string()));
            }

            if index.insert(record.name.clone(), i).is_some() {
                return Err(invalid("duplicate tensor name".to_string()));
            }
            tensors.push(TensorInfo {
                name: record.name,
                kind: record.kind,
                dtype: record.dtype,
                location: record.location,
                dims: record.dims,
            });
        }

        let steps = build_steps(&tensors, blob.ops, backend)?;
        let profiles = build_profiles(&tensors, blob.profiles)?;

        let io = tensors
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_io())
            .map(|(i, _)| i)
            .collect();
        let last_input_reader = steps.iter().rposition(|step| {
            step.inputs
                .iter()
                .any(|&i| tensors[i].kind == TensorKind::Input)
        });

        let mut plan = Plan {
            name: blob.name,
            tensors,
            index,
            io,
            profiles,
            steps,
            activation_sizes: Vec::new(),
            last_input_reader,
        };
        plan.pin_input_dims();
        plan.refine_dims()?;
        plan.activation_sizes = plan.size_profiles()?;

        Ok((plan, constants))
    }

    /// Index of the tensor called `name`, internal tensors included.
    pub(crate) fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Index of the IO tensor called `name`.
    pub(crate) fn lookup_io(&self, name: &str) -> Option<usize> {
        self.lookup(name).filter(|&i| self.tensors[i].is_io())
    }

    pub(crate) fn nb_profiles(&self) -> usize {
        self.profiles.len()
    }

    /// Activation bytes needed by the largest shapes of `profile`.
    pub(crate) fn activation_size(&self, profile: usize) -> Option<usize> {
        self.activation_sizes.get(profile).copied()
    }

    /// Activation bytes needed by any profile.
    pub(crate) fn max_activation_size(&self) -> usize {
        self.activation_sizes.iter().copied().max().unwrap_or(0)
    }

    /// Dims of input `tensor` selected from `profile`.
    ///
    /// Inputs without a range in the profile are static and report their
    /// engine dims.
    pub(crate) fn profile_dims(
        &self,
        tensor: usize,
        profile: usize,
        selector: ProfileSelector,
    ) -> Option<Vec<i64>> {
        let info = self.tensors.get(tensor)?;
        if info.kind != TensorKind::Input {
            return None;
        }
        let ranges = self.profiles.get(profile)?;
        Some(match ranges.get(&tensor) {
            Some(range) => range.get(selector).to_vec(),
            None => info.dims.clone(),
        })
    }

    /// Check an explicit input shape against the engine and `profile`.
    pub(crate) fn check_input_shape(
        &self,
        tensor: usize,
        profile: usize,
        dims: &[i64],
    ) -> Result<(), BindingError> {
        let info = &self.tensors[tensor];
        let invalid = |reason: String| BindingError::InvalidShape {
            name: info.name.clone(),
            reason,
        };
        if info.kind != TensorKind::Input {
            return Err(BindingError::NotAnInput(info.name.clone()));
        }
        if dims.len() != info.dims.len() {
            return Err(invalid(format!(
                "rank {} does not match engine rank {}",
                dims.len(),
                info.dims.len()
            )));
        }
        if dims.iter().any(|&d| d < 0) {
            return Err(invalid(format!("{:?} is not fully specified", dims)));
        }
        for (k, (&d, &fixed)) in dims.iter().zip(&info.dims).enumerate() {
            if fixed != WILDCARD && d != fixed {
                return Err(invalid(format!("dimension {} is fixed to {}, got {}", k, fixed, d)));
            }
        }
        if let Some(range) = self.profiles.get(profile).and_then(|p| p.get(&tensor)) {
            for (k, &d) in dims.iter().enumerate() {
                if d < range.min[k] || d > range.max[k] {
                    return Err(invalid(format!(
                        "dimension {} = {} outside profile {} range [{}, {}]",
                        k, d, profile, range.min[k], range.max[k]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve every shape for a launch.
    ///
    /// `input_dims` supplies the dims of each input; they must be fully
    /// specified.
    pub(crate) fn layout<F>(&self, input_dims: F) -> Result<LaunchLayout, BindingError>
    where
        F: Fn(usize) -> Vec<i64>,
    {
        let resolved = self
            .infer_all(input_dims)
            .map_err(|(step, reason)| BindingError::ShapeInference(format!("op {}: {}", step, reason)))?;

        let mut dims = Vec::with_capacity(resolved.len());
        for (info, d) in self.tensors.iter().zip(resolved) {
            if d.iter().any(|&v| v < 0) {
                return Err(BindingError::UnresolvedShape(info.name.clone()));
            }
            dims.push(d.into_iter().map(|v| v as usize).collect::<Vec<_>>());
        }

        let mut offsets = vec![None; self.tensors.len()];
        let mut activation_bytes: usize = 0;
        for (i, info) in self.tensors.iter().enumerate() {
            let overflow = || BindingError::SizeOverflow(info.name.clone());
            let size = element_count(&dims[i])
                .and_then(|volume| byte_size(info.dtype, volume))
                .ok_or_else(overflow)?;
            if info.kind == TensorKind::Activation {
                offsets[i] = Some(activation_bytes);
                activation_bytes = align_up(size)
                    .and_then(|aligned| activation_bytes.checked_add(aligned))
                    .ok_or_else(overflow)?;
            }
        }

        Ok(LaunchLayout {
            dims,
            offsets,
            activation_bytes,
        })
    }

    /// Run shape inference over the steps, starting from the given input
    /// dims and the engine dims of every other tensor.
    fn infer_all<F>(&self, input_dims: F) -> Result<Vec<Vec<i64>>, (usize, String)>
    where
        F: Fn(usize) -> Vec<i64>,
    {
        let mut dims: Vec<Vec<i64>> = self
            .tensors
            .iter()
            .enumerate()
            .map(|(i, t)| match t.kind {
                TensorKind::Input => input_dims(i),
                _ => t.dims.clone(),
            })
            .collect();

        for (s, step) in self.steps.iter().enumerate() {
            let operands: Vec<&[i64]> = step.inputs.iter().map(|&i| dims[i].as_slice()).collect();
            let inferred = infer_output_dims(&step.op, &operands).map_err(|e| (s, e.to_string()))?;
            let merged = merge_dims(&dims[step.output], &inferred).ok_or_else(|| {
                (
                    s,
                    format!(
                        "'{}' is declared {:?} but computes to {:?}",
                        self.tensors[step.output].name, dims[step.output], inferred
                    ),
                )
            })?;
            dims[step.output] = merged;
        }

        Ok(dims)
    }

    /// Replace input wildcards every profile pins to one value.
    fn pin_input_dims(&mut self) {
        for i in 0..self.tensors.len() {
            if self.tensors[i].kind != TensorKind::Input {
                continue;
            }
            let rank = self.tensors[i].dims.len();
            for k in 0..rank {
                if self.tensors[i].dims[k] != WILDCARD {
                    continue;
                }
                let mut pinned = None;
                let mut all_pinned = true;
                for profile in &self.profiles {
                    match profile.get(&i) {
                        Some(range) if range.min[k] == range.max[k] && pinned.is_none_or(|v| v == range.min[k]) => {
                            pinned = Some(range.min[k]);
                        }
                        _ => all_pinned = false,
                    }
                }
                if let (true, Some(v)) = (all_pinned, pinned) {
                    self.tensors[i].dims[k] = v;
                }
            }
        }
    }

    /// Propagate engine-level input dims through the steps.
    fn refine_dims(&mut self) -> Result<(), BlobError> {
        let refined = self
            .infer_all(|i| self.tensors[i].dims.clone())
            .map_err(|(index, reason)| BlobError::InvalidOp { index, reason })?;
        for (info, dims) in self.tensors.iter_mut().zip(refined) {
            info.dims = dims;
        }
        Ok(())
    }

    /// Check every profile's shapes and size its activation memory.
    fn size_profiles(&self) -> Result<Vec<usize>, BlobError> {
        let mut sizes = Vec::with_capacity(self.profiles.len());
        for (p, ranges) in self.profiles.iter().enumerate() {
            let mut size = 0;
            for selector in [ProfileSelector::Min, ProfileSelector::Opt, ProfileSelector::Max] {
                let seed = |i: usize| match ranges.get(&i) {
                    Some(range) => range.get(selector).to_vec(),
                    None => self.tensors[i].dims.clone(),
                };
                let layout = self.layout(seed).map_err(|e| BlobError::InvalidProfile {
                    index: p,
                    reason: format!("{:?} shapes: {}", selector, e),
                })?;
                size = size.max(layout.activation_bytes);
            }
            sizes.push(size);
        }
        Ok(sizes)
    }
}

fn build_steps(
    tensors: &[TensorInfo],
    ops: Vec<crate::blob::OpRecord>,
    backend: &dyn KernelBackend,
) -> Result<Vec<Step>, BlobError> {
    let mut produced = vec![false; tensors.len()];
    let mut steps = Vec::with_capacity(ops.len());

    for (index, record) in ops.into_iter().enumerate() {
        let invalid = |reason: String| BlobError::InvalidOp { index, reason };
        let operand = |i: u32| {
            tensors
                .get(i as usize)
                .map(|_| i as usize)
                .ok_or_else(|| invalid(format!("tensor index {} out of range", i)))
        };

        let inputs = record
            .inputs
            .iter()
            .map(|&i| operand(i))
            .collect::<Result<Vec<_>, _>>()?;
        let output = operand(record.output)?;

        for &i in &inputs {
            let ready = matches!(tensors[i].kind, TensorKind::Input | TensorKind::Constant) || produced[i];
            if !ready {
                return Err(invalid(format!("reads '{}' before it is produced", tensors[i].name)));
            }
        }
        match tensors[output].kind {
            TensorKind::Output | TensorKind::Activation => {}
            _ => {
                return Err(invalid(format!(
                    "cannot write {:?} tensor '{}'",
                    tensors[output].kind, tensors[output].name
                )));
            }
        }
        if produced[output] {
            return Err(invalid(format!("'{}' is produced twice", tensors[output].name)));
        }

        let dtypes: Vec<DataType> = inputs.iter().map(|&i| tensors[i].dtype).collect();
        let dtype = record.op.output_dtype(&dtypes).map_err(|e| invalid(e.to_string()))?;
        if dtype != tensors[output].dtype {
            return Err(invalid(format!(
                "produces {} but '{}' is {}",
                dtype, tensors[output].name, tensors[output].dtype
            )));
        }
        if !backend.supports(&record.op, dtype) {
            return Err(invalid(format!(
                "{} over {} is not supported by the {} backend",
                record.op.name(),
                dtype,
                backend.name()
            )));
        }

        produced[output] = true;
        steps.push(Step {
            op: record.op,
            inputs,
            output,
        });
    }

    for (i, info) in tensors.iter().enumerate() {
        if matches!(info.kind, TensorKind::Output | TensorKind::Activation) && !produced[i] {
            return Err(BlobError::InvalidTensor {
                name: info.name.clone(),
                reason: "no op produces it".to_string(),
            });
        }
    }

    Ok(steps)
}

fn build_profiles(
    tensors: &[TensorInfo],
    records: Vec<crate::blob::ProfileRecord>,
) -> Result<Vec<HashMap<usize, ShapeRange>>, BlobError> {
    let dynamic_inputs: Vec<usize> = tensors
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind == TensorKind::Input && t.dims.contains(&WILDCARD))
        .map(|(i, _)| i)
        .collect();

    if records.is_empty() {
        if let Some(&i) = dynamic_inputs.first() {
            return Err(BlobError::InvalidProfile {
                index: 0,
                reason: format!(
                    "input '{}' has wildcard dimensions but the engine has no optimization profile",
                    tensors[i].name
                ),
            });
        }
        // Fully static engines run on one implicit profile.
        return Ok(vec![HashMap::new()]);
    }

    let mut profiles = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let invalid = |reason: String| BlobError::InvalidProfile { index, reason };
        let mut ranges = HashMap::with_capacity(record.entries.len());

        for entry in record.entries {
            let t = entry.tensor as usize;
            let info = tensors
                .get(t)
                .ok_or_else(|| invalid(format!("tensor index {} out of range", t)))?;
            if info.kind != TensorKind::Input {
                return Err(invalid(format!("'{}' is not an input", info.name)));
            }
            let rank = info.dims.len();
            if entry.min.len() != rank || entry.opt.len() != rank || entry.max.len() != rank {
                return Err(invalid(format!("'{}' range rank does not match rank {}", info.name, rank)));
            }
            for k in 0..rank {
                let (lo, mid, hi) = (entry.min[k], entry.opt[k], entry.max[k]);
                if hi > MAX_DIM_EXTENT {
                    return Err(invalid(format!(
                        "'{}' dimension {} max {} exceeds {}",
                        info.name, k, hi, MAX_DIM_EXTENT
                    )));
                }
                if lo < 0 || lo > mid || mid > hi {
                    return Err(invalid(format!(
                        "'{}' dimension {} needs 0 <= min <= opt <= max, got {} / {} / {}",
                        info.name, k, lo, mid, hi
                    )));
                }
                let fixed = info.dims[k];
                if fixed != WILDCARD && (lo != fixed || hi != fixed) {
                    return Err(invalid(format!(
                        "'{}' dimension {} is fixed to {} but the range is [{}, {}]",
                        info.name, k, fixed, lo, hi
                    )));
                }
            }
            let range = ShapeRange {
                min: entry.min,
                opt: entry.opt,
                max: entry.max,
            };
            if ranges.insert(t, range).is_some() {
                return Err(invalid(format!("'{}' appears twice", info.name)));
            }
        }

        if let Some(&missing) = dynamic_inputs.iter().find(|i| !ranges.contains_key(i)) {
            return Err(invalid(format!("no range for dynamic input '{}'", tensors[missing].name)));
        }
        profiles.push(ranges);
    }

    Ok(profiles)
}

/// Combine declared and inferred dims, preferring known values.
fn merge_dims(declared: &[i64], inferred: &[i64]) -> Option<Vec<i64>> {
    if declared.len() != inferred.len() {
        return None;
    }
    declared
        .iter()
        .zip(inferred)
        .map(|(&a, &b)| match (a, b) {
            (WILDCARD, b) => Some(b),
            (a, WILDCARD) => Some(a),
            (a, b) if a == b => Some(a),
            _ => None,
        })
        .collect()
}
