#![forbid(unsafe_code)]

use std::f64::consts::PI;
use std::fmt;

use ft_core::{
    DType, DenseTensor, Device, MemoryFormat, RowMajorIndices, TensorCompatError,
    TensorMetaError, contiguous_strides, ensure_compatible, ensure_same_device,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    Meta(TensorMetaError),
    ShapeMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    DimOutOfRange {
        dim: i64,
        rank: usize,
    },
    IndexOutOfRange {
        index: i64,
        size: usize,
    },
    InvalidArgument {
        op: &'static str,
        detail: String,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::Meta(error) => write!(f, "invalid tensor layout: {error}"),
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DimOutOfRange { dim, rank } => {
                write!(f, "dim {dim} out of range for tensor of rank {rank}")
            }
            Self::IndexOutOfRange { index, size } => {
                write!(f, "index {index} out of range for dim of size {size}")
            }
            Self::InvalidArgument { op, detail } => write!(f, "{op}: {detail}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

impl From<TensorMetaError> for KernelError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

pub fn canonicalize_dim(dim: i64, rank: usize) -> Result<usize, KernelError> {
    let bound = rank.max(1) as i64;
    let wrapped = if dim < 0 { dim + bound } else { dim };
    if wrapped < 0 || wrapped >= bound {
        return Err(KernelError::DimOutOfRange { dim, rank });
    }
    Ok(wrapped as usize)
}

fn linear_index(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(idx, stride)| idx * stride).sum()
}

fn build(
    values: Vec<f64>,
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
) -> Result<DenseTensor, KernelError> {
    Ok(DenseTensor::from_vec(values, shape, dtype, device)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Neg,
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Sigmoid,
    Relu,
    Sqrt,
    Lgamma,
    Digamma,
}

impl UnaryOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Abs => "abs",
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
            Self::Relu => "nn.functional.relu",
            Self::Sqrt => "sqrt",
            Self::Lgamma => "lgamma",
            Self::Digamma => "digamma",
        }
    }

    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Abs => x.abs(),
            Self::Neg => -x,
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Relu => x.max(0.0),
            Self::Sqrt => x.sqrt(),
            Self::Lgamma => lgamma_scalar(x),
            Self::Digamma => digamma_scalar(x),
        }
    }
}

pub fn unary(input: &DenseTensor, op: UnaryOp) -> Result<DenseTensor, KernelError> {
    map_values(input, |x| op.apply(x))
}

fn map_values(
    input: &DenseTensor,
    f: impl Fn(f64) -> f64,
) -> Result<DenseTensor, KernelError> {
    let values = input.to_vec().into_iter().map(f).collect();
    build(values, input.shape().to_vec(), input.dtype(), input.device())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Maximum => "maximum",
            Self::Minimum => "minimum",
        }
    }

    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Maximum => {
                if lhs.is_nan() || rhs.is_nan() {
                    f64::NAN
                } else {
                    lhs.max(rhs)
                }
            }
            Self::Minimum => {
                if lhs.is_nan() || rhs.is_nan() {
                    f64::NAN
                } else {
                    lhs.min(rhs)
                }
            }
        }
    }
}

/// Right-aligned broadcast of two shapes.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, KernelError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for position in 0..rank {
        let left = lhs
            .len()
            .checked_sub(rank - position)
            .map_or(1, |dim| lhs[dim]);
        let right = rhs
            .len()
            .checked_sub(rank - position)
            .map_or(1, |dim| rhs[dim]);
        out[position] = match (left, right) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(KernelError::ShapeMismatch {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                });
            }
        };
    }
    Ok(out)
}

/// Values of `input` read at every index of `shape` under broadcasting.
fn broadcast_values(input: &DenseTensor, shape: &[usize]) -> Vec<f64> {
    let values = input.to_vec();
    let src_shape = input.shape();
    let src_strides = contiguous_strides(src_shape);
    let lead = shape.len() - src_shape.len();
    RowMajorIndices::new(shape)
        .map(|index| {
            let linear = src_shape
                .iter()
                .enumerate()
                .map(|(dim, &size)| {
                    let idx = if size == 1 { 0 } else { index[lead + dim] };
                    idx * src_strides[dim]
                })
                .sum::<usize>();
            values[linear]
        })
        .collect()
}

pub fn binary(
    lhs: &DenseTensor,
    rhs: &DenseTensor,
    op: BinaryOp,
) -> Result<DenseTensor, KernelError> {
    ensure_compatible(lhs, rhs)?;
    let shape = broadcast_shapes(lhs.shape(), rhs.shape())?;
    let left = broadcast_values(lhs, &shape);
    let right = broadcast_values(rhs, &shape);
    let values = left
        .into_iter()
        .zip(right)
        .map(|(l, r)| op.apply(l, r))
        .collect();
    build(values, shape, lhs.dtype(), lhs.device())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Prod,
    Amax,
    Amin,
}

impl ReduceOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Prod => "prod",
            Self::Amax => "amax",
            Self::Amin => "amin",
        }
    }

    fn fold(self, lane: &[f64]) -> f64 {
        match self {
            Self::Sum => lane.iter().sum(),
            Self::Mean => lane.iter().sum::<f64>() / lane.len() as f64,
            Self::Prod => lane.iter().product(),
            Self::Amax => lane.iter().copied().fold(f64::NEG_INFINITY, |acc, v| {
                if acc.is_nan() || v.is_nan() {
                    f64::NAN
                } else {
                    acc.max(v)
                }
            }),
            Self::Amin => lane.iter().copied().fold(f64::INFINITY, |acc, v| {
                if acc.is_nan() || v.is_nan() {
                    f64::NAN
                } else {
                    acc.min(v)
                }
            }),
        }
    }
}

fn normalize_dims(
    op: &'static str,
    dims: &[i64],
    rank: usize,
) -> Result<Vec<usize>, KernelError> {
    let mut out = Vec::with_capacity(dims.len());
    for &dim in dims {
        let dim = canonicalize_dim(dim, rank)?;
        if out.contains(&dim) {
            return Err(KernelError::InvalidArgument {
                op,
                detail: format!("dim {dim} appears multiple times in the list of dims"),
            });
        }
        out.push(dim);
    }
    Ok(out)
}

/// Groups elements by their index outside `reduced`; lanes are in row-major order of the kept dims.
fn reduction_lanes(input: &DenseTensor, reduced: &[usize]) -> Vec<Vec<f64>> {
    let shape = input.shape();
    let kept_shape: Vec<usize> = (0..shape.len())
        .filter(|dim| !reduced.contains(dim))
        .map(|dim| shape[dim])
        .collect();
    let kept_strides = contiguous_strides(&kept_shape);
    let lane_count = kept_shape.iter().product::<usize>();
    let mut lanes = vec![Vec::new(); lane_count];
    for (index, value) in RowMajorIndices::new(shape).zip(input.to_vec()) {
        let kept: Vec<usize> = index
            .iter()
            .enumerate()
            .filter(|(dim, _)| !reduced.contains(dim))
            .map(|(_, &idx)| idx)
            .collect();
        lanes[linear_index(&kept, &kept_strides)].push(value);
    }
    lanes
}

fn reduced_shape(shape: &[usize], reduced: &[usize], keepdim: bool) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(dim, &size)| {
            if reduced.contains(&dim) {
                keepdim.then_some(1)
            } else {
                Some(size)
            }
        })
        .collect()
}

/// Reduces over `dims`; `None` or an empty list reduces over every dim.
pub fn reduce(
    input: &DenseTensor,
    op: ReduceOp,
    dims: Option<&[i64]>,
    keepdim: bool,
) -> Result<DenseTensor, KernelError> {
    let rank = input.rank();
    let reduced = match dims {
        Some(dims) if !dims.is_empty() => normalize_dims(op.name(), dims, rank)?,
        _ => (0..rank).collect(),
    };
    if op == ReduceOp::Mean && !input.dtype().is_floating_point() {
        return Err(KernelError::InvalidArgument {
            op: op.name(),
            detail: format!("mean requires a floating dtype, got {}", input.dtype()),
        });
    }
    let lanes = reduction_lanes(input, &reduced);
    let values = lanes.iter().map(|lane| op.fold(lane)).collect();
    build(
        values,
        reduced_shape(input.shape(), &reduced, keepdim),
        input.dtype(),
        input.device(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgReduce {
    Max,
    Min,
}

impl ArgReduce {
    fn pick(self, lane: &[f64]) -> (f64, usize) {
        let mut best = (f64::NAN, 0usize);
        for (position, &value) in lane.iter().enumerate() {
            if position == 0 {
                best = (value, 0);
                continue;
            }
            if best.0.is_nan() {
                break;
            }
            let better = match self {
                Self::Max => value > best.0,
                Self::Min => value < best.0,
            };
            if value.is_nan() || better {
                best = (value, position);
            }
        }
        best
    }
}

/// Index of the extreme element; `dim = None` indexes the flattened input.
pub fn arg_reduce(
    input: &DenseTensor,
    which: ArgReduce,
    dim: Option<i64>,
    keepdim: bool,
) -> Result<DenseTensor, KernelError> {
    match dim {
        None => {
            let (_, position) = which.pick(&input.to_vec());
            let shape = if keepdim {
                vec![1; input.rank()]
            } else {
                Vec::new()
            };
            build(vec![position as f64], shape, DType::I64, input.device())
        }
        Some(dim) => {
            let (_, indices) = extreme_along(input, which, dim, keepdim)?;
            Ok(indices)
        }
    }
}

/// `(values, indices)` of the extreme element along `dim`.
pub fn extreme_along(
    input: &DenseTensor,
    which: ArgReduce,
    dim: i64,
    keepdim: bool,
) -> Result<(DenseTensor, DenseTensor), KernelError> {
    let dim = canonicalize_dim(dim, input.rank())?;
    let reduced = if input.rank() == 0 { Vec::new() } else { vec![dim] };
    let lanes = reduction_lanes(input, &reduced);
    let picks: Vec<(f64, usize)> = lanes.iter().map(|lane| which.pick(lane)).collect();
    let shape = reduced_shape(input.shape(), &reduced, keepdim);
    let values = build(
        picks.iter().map(|(value, _)| *value).collect(),
        shape.clone(),
        input.dtype(),
        input.device(),
    )?;
    let indices = build(
        picks.iter().map(|(_, position)| *position as f64).collect(),
        shape,
        DType::I64,
        input.device(),
    )?;
    Ok((values, indices))
}

/// Applies `f` to every 1-D lane along `dim` and writes the lane back in place.
fn map_lanes(
    input: &DenseTensor,
    dim: usize,
    f: impl Fn(&[f64]) -> Vec<f64>,
) -> Result<DenseTensor, KernelError> {
    let shape = input.shape().to_vec();
    let strides = contiguous_strides(&shape);
    let source = input.to_vec();
    let mut out = vec![0.0; source.len()];
    let mut outer = shape.clone();
    outer[dim] = 1;
    for mut index in RowMajorIndices::new(&outer) {
        index[dim] = 0;
        let base = linear_index(&index, &strides);
        let lane: Vec<f64> = (0..shape[dim])
            .map(|k| source[base + k * strides[dim]])
            .collect();
        for (k, value) in f(&lane).into_iter().enumerate() {
            out[base + k * strides[dim]] = value;
        }
    }
    build(out, shape, input.dtype(), input.device())
}

pub fn softmax(input: &DenseTensor, dim: i64) -> Result<DenseTensor, KernelError> {
    if input.rank() == 0 {
        return map_values(input, |_| 1.0);
    }
    let dim = canonicalize_dim(dim, input.rank())?;
    map_lanes(input, dim, |lane| {
        let peak = lane.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = lane.iter().map(|v| (v - peak).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|v| v / total).collect()
    })
}

pub fn cumsum(input: &DenseTensor, dim: i64) -> Result<DenseTensor, KernelError> {
    if input.rank() == 0 {
        return Ok(input.contiguous_copy());
    }
    let dim = canonicalize_dim(dim, input.rank())?;
    map_lanes(input, dim, |lane| {
        lane.iter()
            .scan(0.0, |acc, v| {
                *acc += v;
                Some(*acc)
            })
            .collect()
    })
}

pub fn transpose(input: &DenseTensor, dim0: i64, dim1: i64) -> Result<DenseTensor, KernelError> {
    let rank = input.rank();
    if rank == 0 {
        return Ok(input.clone());
    }
    let dim0 = canonicalize_dim(dim0, rank)?;
    let dim1 = canonicalize_dim(dim1, rank)?;
    Ok(input.transpose(dim0, dim1)?)
}

pub fn unsqueeze(input: &DenseTensor, dim: i64) -> Result<DenseTensor, KernelError> {
    let dim = canonicalize_dim(dim, input.rank() + 1)?;
    Ok(input.unsqueeze(dim)?)
}

fn ensure_joinable(op: &'static str, tensors: &[DenseTensor]) -> Result<(), KernelError> {
    let first = tensors.first().ok_or_else(|| KernelError::InvalidArgument {
        op,
        detail: "expected a non-empty list of tensors".to_string(),
    })?;
    for other in &tensors[1..] {
        ensure_compatible(first, other)?;
    }
    Ok(())
}

/// Joins equally-shaped tensors along a new dim.
pub fn stack(tensors: &[DenseTensor], dim: i64) -> Result<DenseTensor, KernelError> {
    ensure_joinable("stack", tensors)?;
    let first = &tensors[0];
    if let Some(other) = tensors.iter().find(|t| t.shape() != first.shape()) {
        return Err(KernelError::ShapeMismatch {
            lhs: first.shape().to_vec(),
            rhs: other.shape().to_vec(),
        });
    }
    let dim = canonicalize_dim(dim, first.rank() + 1)?;
    let expanded = tensors
        .iter()
        .map(|t| t.unsqueeze(dim))
        .collect::<Result<Vec<_>, _>>()?;
    cat(&expanded, dim as i64)
}

/// Concatenates along an existing dim; all other dims must agree.
pub fn cat(tensors: &[DenseTensor], dim: i64) -> Result<DenseTensor, KernelError> {
    ensure_joinable("cat", tensors)?;
    let first = &tensors[0];
    if first.rank() == 0 {
        return Err(KernelError::InvalidArgument {
            op: "cat",
            detail: "zero-dimensional tensors cannot be concatenated".to_string(),
        });
    }
    let dim = canonicalize_dim(dim, first.rank())?;
    for other in &tensors[1..] {
        let agrees = other.rank() == first.rank()
            && other
                .shape()
                .iter()
                .zip(first.shape())
                .enumerate()
                .all(|(d, (a, b))| d == dim || a == b);
        if !agrees {
            return Err(KernelError::ShapeMismatch {
                lhs: first.shape().to_vec(),
                rhs: other.shape().to_vec(),
            });
        }
    }

    let mut shape = first.shape().to_vec();
    shape[dim] = tensors.iter().map(|t| t.shape()[dim]).sum();
    let strides = contiguous_strides(&shape);
    let mut out = vec![0.0; shape.iter().product()];
    let mut start = 0usize;
    for tensor in tensors {
        for (mut index, value) in RowMajorIndices::new(tensor.shape()).zip(tensor.to_vec()) {
            index[dim] += start;
            out[linear_index(&index, &strides)] = value;
        }
        start += tensor.shape()[dim];
    }
    build(out, shape, first.dtype(), first.device())
}

fn matmul_2d(lhs: &[f64], rhs: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for row in 0..m {
        for inner in 0..k {
            let left = lhs[row * k + inner];
            for col in 0..n {
                out[row * n + col] += left * rhs[inner * n + col];
            }
        }
    }
    out
}

/// Matrix product with 1-D promotion and broadcast batch dims.
pub fn matmul(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, KernelError> {
    ensure_compatible(lhs, rhs)?;
    if lhs.rank() == 0 || rhs.rank() == 0 {
        return Err(KernelError::InvalidArgument {
            op: "matmul",
            detail: "both arguments need at least 1 dimension".to_string(),
        });
    }
    let lhs_vector = lhs.rank() == 1;
    let rhs_vector = rhs.rank() == 1;
    let left = if lhs_vector { lhs.unsqueeze(0)? } else { lhs.clone() };
    let right = if rhs_vector { rhs.unsqueeze(1)? } else { rhs.clone() };

    let (lshape, rshape) = (left.shape(), right.shape());
    let (m, k) = (lshape[lshape.len() - 2], lshape[lshape.len() - 1]);
    let (k2, n) = (rshape[rshape.len() - 2], rshape[rshape.len() - 1]);
    if k != k2 {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    let batch = broadcast_shapes(&lshape[..lshape.len() - 2], &rshape[..rshape.len() - 2])?;

    let mut left_shape = batch.clone();
    left_shape.extend([m, k]);
    let mut right_shape = batch.clone();
    right_shape.extend([k, n]);
    let left_values = broadcast_values(&left, &left_shape);
    let right_values = broadcast_values(&right, &right_shape);

    let batch_count = batch.iter().product::<usize>();
    let mut out = Vec::with_capacity(batch_count * m * n);
    for b in 0..batch_count {
        out.extend(matmul_2d(
            &left_values[b * m * k..(b + 1) * m * k],
            &right_values[b * k * n..(b + 1) * k * n],
            m,
            k,
            n,
        ));
    }

    let mut shape = batch;
    if !lhs_vector {
        shape.push(m);
    }
    if !rhs_vector {
        shape.push(n);
    }
    build(out, shape, lhs.dtype(), lhs.device())
}

/// Batched product of `(B, n, m)` and `(B, m, p)`.
pub fn bmm(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, KernelError> {
    if lhs.rank() != 3 || rhs.rank() != 3 || lhs.shape()[0] != rhs.shape()[0] {
        return Err(KernelError::InvalidArgument {
            op: "bmm",
            detail: format!(
                "expected 3-D tensors with equal batch size, got {:?} and {:?}",
                lhs.shape(),
                rhs.shape()
            ),
        });
    }
    matmul(lhs, rhs)
}

fn row_index(raw: f64, rows: usize) -> Result<usize, KernelError> {
    let index = raw as i64;
    let wrapped = if index < 0 { index + rows as i64 } else { index };
    if wrapped < 0 || wrapped >= rows as i64 {
        return Err(KernelError::IndexOutOfRange { index, size: rows });
    }
    Ok(wrapped as usize)
}

fn ensure_index_dtype(op: &'static str, indices: &DenseTensor) -> Result<(), KernelError> {
    if indices.dtype() != DType::I64 {
        return Err(KernelError::InvalidArgument {
            op,
            detail: format!("indices must be int64, got {}", indices.dtype()),
        });
    }
    Ok(())
}

fn ensure_weight_matrix(op: &'static str, weight: &DenseTensor) -> Result<(), KernelError> {
    if weight.rank() != 2 {
        return Err(KernelError::InvalidArgument {
            op,
            detail: format!("weight must be 2-D, got shape {:?}", weight.shape()),
        });
    }
    Ok(())
}

/// Row lookup; `padding_idx` only affects gradients, so the forward result ignores it.
pub fn embedding(
    indices: &DenseTensor,
    weight: &DenseTensor,
    padding_idx: Option<i64>,
) -> Result<DenseTensor, KernelError> {
    ensure_index_dtype("embedding", indices)?;
    ensure_weight_matrix("embedding", weight)?;
    ensure_same_device(indices, weight)?;
    let (rows, width) = (weight.shape()[0], weight.shape()[1]);
    if let Some(padding_idx) = padding_idx {
        row_index(padding_idx as f64, rows)?;
    }
    let table = weight.to_vec();
    let mut out = Vec::with_capacity(indices.numel() * width);
    for raw in indices.to_vec() {
        let row = row_index(raw, rows)?;
        out.extend_from_slice(&table[row * width..(row + 1) * width]);
    }
    let mut shape = indices.shape().to_vec();
    shape.push(width);
    build(out, shape, weight.dtype(), weight.device())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BagMode {
    Sum,
    Mean,
    Max,
}

impl BagMode {
    pub fn parse(mode: &str) -> Result<Self, KernelError> {
        match mode {
            "sum" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            "max" => Ok(Self::Max),
            other => Err(KernelError::InvalidArgument {
                op: "embedding_bag",
                detail: format!("unknown mode {other:?}"),
            }),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Max => "max",
        }
    }
}

/// Pools the embedding rows of each bag; bag `b` covers `indices[offsets[b]..offsets[b + 1]]`.
pub fn embedding_bag(
    indices: &DenseTensor,
    weight: &DenseTensor,
    offsets: &[usize],
    mode: BagMode,
    per_sample_weights: Option<&DenseTensor>,
) -> Result<DenseTensor, KernelError> {
    ensure_index_dtype("embedding_bag", indices)?;
    ensure_weight_matrix("embedding_bag", weight)?;
    if indices.rank() != 1 {
        return Err(KernelError::InvalidArgument {
            op: "embedding_bag",
            detail: format!("expected 1-D indices with offsets, got {:?}", indices.shape()),
        });
    }
    let count = indices.numel();
    if offsets.first().is_some_and(|&first| first != 0)
        || offsets.windows(2).any(|pair| pair[0] > pair[1])
        || offsets.last().is_some_and(|&last| last > count)
    {
        return Err(KernelError::InvalidArgument {
            op: "embedding_bag",
            detail: format!("offsets {offsets:?} do not partition {count} indices"),
        });
    }
    let sample_weights = match per_sample_weights {
        Some(weights) => {
            if mode != BagMode::Sum {
                return Err(KernelError::InvalidArgument {
                    op: "embedding_bag",
                    detail: format!(
                        "per_sample_weights is only supported for mode='sum', got mode='{}'",
                        mode.as_str()
                    ),
                });
            }
            if weights.shape() != indices.shape() {
                return Err(KernelError::ShapeMismatch {
                    lhs: indices.shape().to_vec(),
                    rhs: weights.shape().to_vec(),
                });
            }
            Some(weights.to_vec())
        }
        None => None,
    };

    let (rows, width) = (weight.shape()[0], weight.shape()[1]);
    let table = weight.to_vec();
    let flat = indices.to_vec();
    let mut out = Vec::with_capacity(offsets.len() * width);
    for (bag, &start) in offsets.iter().enumerate() {
        let end = offsets.get(bag + 1).copied().unwrap_or(count);
        let mut pooled = match mode {
            BagMode::Max if end > start => vec![f64::NEG_INFINITY; width],
            _ => vec![0.0; width],
        };
        for position in start..end {
            let row = row_index(flat[position], rows)?;
            let scale = sample_weights.as_ref().map_or(1.0, |w| w[position]);
            for (slot, &value) in pooled
                .iter_mut()
                .zip(&table[row * width..(row + 1) * width])
            {
                match mode {
                    BagMode::Sum | BagMode::Mean => *slot += scale * value,
                    BagMode::Max => *slot = slot.max(value),
                }
            }
        }
        if mode == BagMode::Mean && end > start {
            let len = (end - start) as f64;
            pooled.iter_mut().for_each(|slot| *slot /= len);
        }
        out.extend(pooled);
    }
    build(out, vec![offsets.len(), width], weight.dtype(), weight.device())
}

/// Writes `values` at the positions selected by the leading index tensors.
///
/// Index tensors broadcast against each other; an index tensor with zero
/// elements selects nothing.
pub fn index_put(
    input: &DenseTensor,
    indices: &[DenseTensor],
    values: &DenseTensor,
    accumulate: bool,
) -> Result<DenseTensor, KernelError> {
    if indices.len() > input.rank() {
        return Err(KernelError::InvalidArgument {
            op: "index_put",
            detail: format!(
                "too many indices ({}) for tensor of rank {}",
                indices.len(),
                input.rank()
            ),
        });
    }
    let mut count = 1usize;
    for index in indices {
        ensure_index_dtype("index_put", index)?;
        let numel = index.numel();
        if numel != 1 && count != 1 && numel != count {
            return Err(KernelError::ShapeMismatch {
                lhs: vec![count],
                rhs: index.shape().to_vec(),
            });
        }
        if numel != 1 {
            count = numel;
        }
    }
    if indices.iter().any(|index| index.numel() == 0) {
        count = 0;
    }

    let shape = input.shape().to_vec();
    let strides = contiguous_strides(&shape);
    let sub_shape = &shape[indices.len()..];
    let sub_numel = sub_shape.iter().product::<usize>();
    let source = values.to_vec();
    if source.len() != 1 && source.len() != sub_numel && source.len() != count * sub_numel {
        return Err(KernelError::ShapeMismatch {
            lhs: shape.clone(),
            rhs: values.shape().to_vec(),
        });
    }

    let index_values: Vec<Vec<f64>> = indices.iter().map(DenseTensor::to_vec).collect();
    let mut out = input.to_vec();
    for position in 0..count {
        let mut prefix = Vec::with_capacity(indices.len());
        for (dim, column) in index_values.iter().enumerate() {
            let raw = if column.len() == 1 { column[0] } else { column[position] };
            prefix.push(row_index(raw, shape[dim])?);
        }
        let base = linear_index(&prefix, &strides[..prefix.len()]);
        for (offset, sub_index) in RowMajorIndices::new(sub_shape).enumerate() {
            let target = base + linear_index(&sub_index, &strides[prefix.len()..]);
            let value = match source.len() {
                1 => source[0],
                n if n == sub_numel => source[offset],
                _ => source[position * sub_numel + offset],
            };
            if accumulate {
                out[target] += value;
            } else {
                out[target] = value;
            }
        }
    }
    build(out, shape, input.dtype(), input.device())
}

/// Elements of `input` where the broadcast `mask` is set, as a 1-D tensor.
pub fn masked_select(input: &DenseTensor, mask: &DenseTensor) -> Result<DenseTensor, KernelError> {
    if mask.dtype() != DType::Bool {
        return Err(KernelError::InvalidArgument {
            op: "masked_select",
            detail: format!("mask must be bool, got {}", mask.dtype()),
        });
    }
    ensure_same_device(input, mask)?;
    let shape = broadcast_shapes(input.shape(), mask.shape())?;
    let selected: Vec<f64> = broadcast_values(input, &shape)
        .into_iter()
        .zip(broadcast_values(mask, &shape))
        .filter(|(_, keep)| *keep != 0.0)
        .map(|(value, _)| value)
        .collect();
    let len = selected.len();
    build(selected, vec![len], input.dtype(), input.device())
}

pub fn clone_with_format(input: &DenseTensor, memory_format: MemoryFormat) -> DenseTensor {
    match memory_format {
        MemoryFormat::Contiguous => input.contiguous_copy(),
        MemoryFormat::Preserve => input.layout_preserving_copy(),
    }
}

/// Dtype and/or device conversion; returns the input itself when nothing changes.
#[must_use]
pub fn to_dtype_device(
    input: &DenseTensor,
    dtype: Option<DType>,
    device: Option<Device>,
) -> DenseTensor {
    let mut out = input.clone();
    if let Some(dtype) = dtype
        && dtype != out.dtype()
    {
        out = out.cast(dtype);
    }
    if let Some(device) = device
        && device != out.device()
    {
        out = out.to_device(device);
    }
    out
}

/// `input @ weight^T + bias` over the trailing dim.
pub fn linear(
    input: &DenseTensor,
    weight: &DenseTensor,
    bias: Option<&DenseTensor>,
) -> Result<DenseTensor, KernelError> {
    ensure_weight_matrix("linear", weight)?;
    let product = matmul(input, &weight.transpose(0, 1)?)?;
    match bias {
        Some(bias) => binary(&product, bias, BinaryOp::Add),
        None => Ok(product),
    }
}

/// Root-mean-square normalization over the trailing `normalized_shape` dims.
///
/// `eps` defaults to the machine epsilon of the input dtype.
pub fn rms_norm(
    input: &DenseTensor,
    normalized_shape: &[usize],
    weight: Option<&DenseTensor>,
    eps: Option<f64>,
) -> Result<DenseTensor, KernelError> {
    let shape = input.shape();
    let tail = normalized_shape.len();
    if tail > shape.len() || shape[shape.len() - tail..] != *normalized_shape {
        return Err(KernelError::ShapeMismatch {
            lhs: shape.to_vec(),
            rhs: normalized_shape.to_vec(),
        });
    }
    if let Some(weight) = weight
        && weight.shape() != normalized_shape
    {
        return Err(KernelError::ShapeMismatch {
            lhs: normalized_shape.to_vec(),
            rhs: weight.shape().to_vec(),
        });
    }
    let eps = match eps.or_else(|| input.dtype().eps()) {
        Some(eps) => eps,
        None => {
            return Err(KernelError::InvalidArgument {
                op: "rms_norm",
                detail: format!("requires a floating dtype, got {}", input.dtype()),
            });
        }
    };

    let group = normalized_shape.iter().product::<usize>();
    let scale = weight.map(DenseTensor::to_vec);
    let values = input.to_vec();
    let mut out = Vec::with_capacity(values.len());
    if group > 0 {
        for chunk in values.chunks(group) {
            let mean_square = chunk.iter().map(|v| v * v).sum::<f64>() / group as f64;
            let inv = 1.0 / (mean_square + eps).sqrt();
            for (position, value) in chunk.iter().enumerate() {
                let w = scale.as_ref().map_or(1.0, |s| s[position]);
                out.push(value * inv * w);
            }
        }
    }
    build(out, shape.to_vec(), input.dtype(), input.device())
}

/// `x` where `x > threshold`, else `value`.
pub fn threshold(
    input: &DenseTensor,
    threshold: f64,
    value: f64,
) -> Result<DenseTensor, KernelError> {
    map_values(input, |x| if x > threshold { x } else { value })
}

pub fn polygamma(n: u32, input: &DenseTensor) -> Result<DenseTensor, KernelError> {
    map_values(input, |x| polygamma_scalar(n, x))
}

/// Multivariate log-gamma of order `p`; elements at or below `(p - 1) / 2` map to NaN.
pub fn mvlgamma(input: &DenseTensor, p: u32) -> Result<DenseTensor, KernelError> {
    if p == 0 {
        return Err(KernelError::InvalidArgument {
            op: "mvlgamma",
            detail: "p has to be greater than or equal to 1".to_string(),
        });
    }
    if !input.dtype().is_floating_point() {
        return Err(KernelError::InvalidArgument {
            op: "mvlgamma",
            detail: format!("requires a floating dtype, got {}", input.dtype()),
        });
    }
    let order = f64::from(p);
    let constant = order * (order - 1.0) / 4.0 * PI.ln();
    map_values(input, |x| {
        if x <= (order - 1.0) / 2.0 {
            return f64::NAN;
        }
        constant
            + (1..=p)
                .map(|j| lgamma_scalar(x + (1.0 - f64::from(j)) / 2.0))
                .sum::<f64>()
    })
}

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFICIENTS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// `ln |Γ(x)|`; infinite at the poles.
#[must_use]
pub fn lgamma_scalar(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x <= 0.0 && x == x.floor() {
        return f64::INFINITY;
    }
    if x < 0.5 {
        return (PI / (PI * x).sin().abs()).ln() - lgamma_scalar(1.0 - x);
    }
    let z = x - 1.0;
    let t = z + LANCZOS_G + 0.5;
    let series = LANCZOS_COEFFICIENTS
        .iter()
        .enumerate()
        .skip(1)
        .fold(LANCZOS_COEFFICIENTS[0], |acc, (i, c)| acc + c / (z + i as f64));
    0.5 * (2.0 * PI).ln() + (z + 0.5) * t.ln() - t + series.ln()
}

#[must_use]
pub fn digamma_scalar(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x == 0.0 {
        return f64::NEG_INFINITY;
    }
    if x < 0.0 && x == x.floor() {
        return f64::NAN;
    }
    let mut x = x;
    let mut shift = 0.0;
    while x < 10.0 {
        shift -= 1.0 / x;
        x += 1.0;
    }
    let inv2 = 1.0 / (x * x);
    let tail = inv2
        * (1.0 / 12.0
            - inv2
                * (1.0 / 120.0
                    - inv2
                        * (1.0 / 252.0
                            - inv2
                                * (1.0 / 240.0
                                    - inv2 * (1.0 / 132.0 - inv2 * (691.0 / 32_760.0))))));
    shift + x.ln() - 0.5 / x - tail
}

/// `B_2k / (2k)!` for k = 1..=7.
const ZETA_TAIL: [f64; 7] = [
    1.0 / 12.0,
    -1.0 / 720.0,
    1.0 / 30_240.0,
    -1.0 / 1_209_600.0,
    1.0 / 47_900_160.0,
    -691.0 / 1_307_674_368_000.0,
    1.0 / 74_724_249_600.0,
];

/// Hurwitz zeta `ζ(s, q)` for integer `s >= 2`.
fn hurwitz_zeta(s: i32, q: f64) -> f64 {
    if q <= 0.0 && q == q.floor() {
        return f64::INFINITY;
    }
    let mut q = q;
    let mut sum = 0.0;
    while q < 10.0 {
        sum += q.powi(-s);
        q += 1.0;
    }
    let s_f = f64::from(s);
    let mut tail = q.powi(1 - s) / (s_f - 1.0) + 0.5 * q.powi(-s);
    let mut factor = s_f * q.powi(-s - 1);
    for (k, coefficient) in ZETA_TAIL.iter().enumerate() {
        tail += coefficient * factor;
        let step = 2.0 * (k as f64 + 1.0);
        factor *= (s_f + step - 1.0) * (s_f + step) / (q * q);
    }
    sum + tail
}

/// `ψ^(n)(x)`, the n-th derivative of the digamma function.
#[must_use]
pub fn polygamma_scalar(n: u32, x: f64) -> f64 {
    if n == 0 {
        return digamma_scalar(x);
    }
    if x.is_nan() {
        return f64::NAN;
    }
    let factorial = (1..=n).map(f64::from).product::<f64>();
    let sign = if n % 2 == 1 { 1.0 } else { -1.0 };
    sign * factorial * hurwitz_zeta(n as i32 + 1, x)
}
