#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F64,
    F32,
    F16,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::F64 | Self::F32 | Self::F16)
    }

    /// Rounds an f64 value to what this dtype can represent.
    #[must_use]
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::F64 => value,
            Self::F32 => f64::from(value as f32),
            Self::F16 => half::f16::from_f64(value).to_f64(),
            Self::I64 => value.trunc(),
            Self::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Machine epsilon for floating dtypes; `None` for integral ones.
    #[must_use]
    pub fn eps(self) -> Option<f64> {
        match self {
            Self::F64 => Some(f64::EPSILON),
            Self::F32 => Some(f64::from(f32::EPSILON)),
            Self::F16 => Some(half::f16::EPSILON.to_f64()),
            Self::I64 | Self::Bool => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F64 => "float64",
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::I64 => "int64",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    Contiguous,
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(dtype: DType, device: Device) -> Self {
        Self {
            shape: Vec::new(),
            strides: Vec::new(),
            storage_offset: 0,
            dtype,
            device,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        self.max_storage_index().map(|_| ())
    }

    /// Largest storage index this layout can touch, or `None` for empty tensors.
    pub fn max_storage_index(&self) -> Result<Option<usize>, TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                return Ok(None);
            }

            let span = stride
                .checked_mul(size - 1)
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }

        self.storage_offset
            .checked_add(max_linear_offset)
            .map(Some)
            .ok_or(TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    /// True when the layout is some permutation of a contiguous layout.
    #[must_use]
    pub fn is_non_overlapping_and_dense(&self) -> bool {
        let mut order: Vec<usize> = (0..self.rank()).collect();
        order.sort_by_key(|&dim| (self.strides[dim], self.shape[dim]));
        let mut expected = 1usize;
        for dim in order {
            let size = self.shape[dim];
            if size == 1 {
                continue;
            }
            if self.strides[dim] != expected {
                return false;
            }
            expected = expected.saturating_mul(size);
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }

            let step = idx
                .checked_mul(stride)
                .ok_or(TensorMetaError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }

        Ok(linear)
    }

    /// Storage positions of every element, in logical row-major order.
    #[must_use]
    pub fn storage_indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.numel());
        for index in RowMajorIndices::new(&self.shape) {
            let linear = index
                .iter()
                .zip(self.strides.iter())
                .fold(self.storage_offset, |acc, (idx, stride)| acc + idx * stride);
            out.push(linear);
        }
        out
    }

    pub fn transposed(&self, dim0: usize, dim1: usize) -> Result<Self, TensorMetaError> {
        let rank = self.rank();
        for dim in [dim0, dim1] {
            if dim >= rank {
                return Err(TensorMetaError::DimOutOfRange { dim, rank });
            }
        }
        let mut out = self.clone();
        out.shape.swap(dim0, dim1);
        out.strides.swap(dim0, dim1);
        Ok(out)
    }

    pub fn narrowed(&self, dim: usize, start: usize, len: usize) -> Result<Self, TensorMetaError> {
        let rank = self.rank();
        if dim >= rank {
            return Err(TensorMetaError::DimOutOfRange { dim, rank });
        }
        let size = self.shape[dim];
        if start.checked_add(len).is_none_or(|end| end > size) {
            return Err(TensorMetaError::IndexOutOfBounds {
                dim,
                index: start.saturating_add(len),
                size,
            });
        }
        let mut out = self.clone();
        out.shape[dim] = len;
        out.storage_offset += start * self.strides[dim];
        Ok(out)
    }

    pub fn selected(&self, dim: usize, index: usize) -> Result<Self, TensorMetaError> {
        let mut out = self.narrowed(dim, index, 1)?;
        if index >= self.shape[dim] {
            return Err(TensorMetaError::IndexOutOfBounds {
                dim,
                index,
                size: self.shape[dim],
            });
        }
        out.shape.remove(dim);
        out.strides.remove(dim);
        Ok(out)
    }

    pub fn unsqueezed(&self, dim: usize) -> Result<Self, TensorMetaError> {
        let rank = self.rank();
        if dim > rank {
            return Err(TensorMetaError::DimOutOfRange { dim, rank });
        }
        let stride = if dim < rank {
            self.strides[dim] * self.shape[dim]
        } else {
            1
        };
        let mut out = self.clone();
        out.shape.insert(dim, 1);
        out.strides.insert(dim, stride);
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
    DimOutOfRange {
        dim: usize,
        rank: usize,
    },
    StorageLengthMismatch {
        needed: usize,
        available: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
            Self::DimOutOfRange { dim, rank } => {
                write!(f, "dim {dim} out of range for rank {rank}")
            }
            Self::StorageLengthMismatch { needed, available } => {
                write!(
                    f,
                    "storage too small: needed={needed}, available={available}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

/// Strided dense array over shared f64 storage.
///
/// Values of every dtype are held as f64 and rounded through [`DType::round`]
/// on construction; integer and boolean tensors store whole numbers.
#[derive(Debug, Clone)]
pub struct DenseTensor {
    id: u64,
    storage_id: u64,
    meta: TensorMeta,
    storage: Arc<Vec<f64>>,
    requires_grad: bool,
}

impl DenseTensor {
    pub fn from_vec(
        values: Vec<f64>,
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = TensorMeta::from_shape(shape, dtype, device);
        if meta.numel() != values.len() {
            return Err(TensorMetaError::StorageLengthMismatch {
                needed: meta.numel(),
                available: values.len(),
            });
        }
        let values = values.into_iter().map(|value| dtype.round(value)).collect();
        Ok(Self::fresh(meta, values))
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: DType, device: Device) -> Self {
        Self::fresh(TensorMeta::scalar(dtype, device), vec![dtype.round(value)])
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64, dtype: DType, device: Device) -> Self {
        let meta = TensorMeta::from_shape(shape, dtype, device);
        let values = vec![dtype.round(value); meta.numel()];
        Self::fresh(meta, values)
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        Self::full(shape, 0.0, dtype, device)
    }

    /// `[0, 1, ..., len - 1]` as an int64 vector.
    #[must_use]
    pub fn arange(len: usize, device: Device) -> Self {
        let values = (0..len).map(|value| value as f64).collect();
        Self::fresh(TensorMeta::from_shape(vec![len], DType::I64, device), values)
    }

    /// Builds a view over existing storage; the layout must stay in bounds.
    pub fn from_storage(storage: Arc<Vec<f64>>, meta: TensorMeta) -> Result<Self, TensorMetaError> {
        if let Some(max_index) = meta.max_storage_index()?
            && max_index >= storage.len()
        {
            return Err(TensorMetaError::StorageLengthMismatch {
                needed: max_index + 1,
                available: storage.len(),
            });
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            storage,
            requires_grad: false,
        })
    }

    pub fn randn(
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
        rng: &mut impl Rng,
    ) -> Self {
        let meta = TensorMeta::from_shape(shape, dtype, device);
        let values = (0..meta.numel())
            .map(|_| dtype.round(rng.sample::<f64, _>(StandardNormal)))
            .collect();
        Self::fresh(meta, values)
    }

    /// Uniform integers in `[low, high)` as an int64 tensor.
    pub fn randint(
        low: i64,
        high: i64,
        shape: Vec<usize>,
        device: Device,
        rng: &mut impl Rng,
    ) -> Self {
        let meta = TensorMeta::from_shape(shape, DType::I64, device);
        let values = (0..meta.numel())
            .map(|_| rng.gen_range(low..high) as f64)
            .collect();
        Self::fresh(meta, values)
    }

    #[must_use]
    pub fn randn_like(&self, rng: &mut impl Rng) -> Self {
        Self::randn(self.shape().to_vec(), self.dtype(), self.device(), rng)
            .with_requires_grad(self.requires_grad)
    }

    fn fresh(meta: TensorMeta, values: Vec<f64>) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            storage: Arc::new(values),
            requires_grad: false,
        }
    }

    fn view(&self, meta: TensorMeta) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage_id: self.storage_id,
            meta,
            storage: Arc::clone(&self.storage),
            requires_grad: self.requires_grad,
        }
    }

    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn storage_id(&self) -> u64 {
        self.storage_id
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.meta.rank()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.meta.is_contiguous()
    }

    /// Raw backing storage, including any elements outside this view.
    #[must_use]
    pub fn storage(&self) -> &Arc<Vec<f64>> {
        &self.storage
    }

    pub fn get(&self, index: &[usize]) -> Result<f64, TensorMetaError> {
        let linear = self.meta.storage_index_for(index)?;
        Ok(self.storage[linear])
    }

    /// Element values in logical row-major order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        if self.meta.is_contiguous() {
            let start = self.meta.storage_offset();
            return self.storage[start..start + self.numel()].to_vec();
        }
        self.meta
            .storage_indices()
            .into_iter()
            .map(|linear| self.storage[linear])
            .collect()
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f64, TensorMetaError> {
        if self.numel() != 1 {
            return Err(TensorMetaError::StorageLengthMismatch {
                needed: 1,
                available: self.numel(),
            });
        }
        Ok(self.to_vec()[0])
    }

    /// Fresh, contiguous copy with its own storage.
    #[must_use]
    pub fn contiguous_copy(&self) -> Self {
        let meta = TensorMeta::from_shape(self.shape().to_vec(), self.dtype(), self.device());
        Self::fresh(meta, self.to_vec()).with_requires_grad(self.requires_grad)
    }

    /// Copy that keeps the dimension order of a permuted-dense layout.
    #[must_use]
    pub fn layout_preserving_copy(&self) -> Self {
        if !self.meta.is_non_overlapping_and_dense() || self.meta.is_contiguous() {
            return self.contiguous_copy();
        }
        let rank = self.rank();
        let mut order: Vec<usize> = (0..rank).collect();
        order.sort_by(|&a, &b| self.meta.strides()[b].cmp(&self.meta.strides()[a]));
        let permuted_shape: Vec<usize> = order.iter().map(|&dim| self.shape()[dim]).collect();
        let permuted_strides = contiguous_strides(&permuted_shape);
        let mut strides = vec![0usize; rank];
        for (position, &dim) in order.iter().enumerate() {
            strides[dim] = permuted_strides[position];
        }
        let meta = TensorMeta {
            shape: self.shape().to_vec(),
            strides,
            storage_offset: 0,
            dtype: self.dtype(),
            device: self.device(),
        };
        let mut values = vec![0.0; self.numel()];
        for (index, value) in RowMajorIndices::new(self.shape()).zip(self.to_vec()) {
            let linear = index
                .iter()
                .zip(meta.strides())
                .map(|(idx, stride)| idx * stride)
                .sum::<usize>();
            values[linear] = value;
        }
        Self::fresh(meta, values).with_requires_grad(self.requires_grad)
    }

    /// Copy with values rounded into another dtype.
    #[must_use]
    pub fn cast(&self, dtype: DType) -> Self {
        let meta = TensorMeta::from_shape(self.shape().to_vec(), dtype, self.device());
        let values = self.to_vec().into_iter().map(|v| dtype.round(v)).collect();
        Self::fresh(meta, values).with_requires_grad(self.requires_grad && dtype.is_floating_point())
    }

    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        let meta = TensorMeta::from_shape(self.shape().to_vec(), self.dtype(), device);
        Self::fresh(meta, self.to_vec()).with_requires_grad(self.requires_grad)
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self, TensorMetaError> {
        Ok(self.view(self.meta.transposed(dim0, dim1)?))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self, TensorMetaError> {
        Ok(self.view(self.meta.narrowed(dim, start, len)?))
    }

    pub fn select(&self, dim: usize, index: usize) -> Result<Self, TensorMetaError> {
        Ok(self.view(self.meta.selected(dim, index)?))
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self, TensorMetaError> {
        Ok(self.view(self.meta.unsqueezed(dim)?))
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, TensorMetaError> {
        let meta = TensorMeta::from_shape(shape, self.dtype(), self.device());
        if meta.numel() != self.numel() {
            return Err(TensorMetaError::StorageLengthMismatch {
                needed: meta.numel(),
                available: self.numel(),
            });
        }
        Ok(Self::fresh(meta, self.to_vec()).with_requires_grad(self.requires_grad))
    }

    /// Same shape and all elements within `atol + rtol * |other|`; NaNs compare equal.
    #[must_use]
    pub fn allclose(&self, other: &Self, rtol: f64, atol: f64) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        self.to_vec()
            .into_iter()
            .zip(other.to_vec())
            .all(|(lhs, rhs)| {
                (lhs.is_nan() && rhs.is_nan())
                    || lhs == rhs
                    || (lhs - rhs).abs() <= atol + rtol * rhs.abs()
            })
    }
}

impl PartialEq for DenseTensor {
    fn eq(&self, other: &Self) -> bool {
        self.dtype() == other.dtype()
            && self.device() == other.device()
            && self.shape() == other.shape()
            && self.to_vec() == other.to_vec()
    }
}

pub fn ensure_compatible(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }
    ensure_same_device(lhs, rhs)
}

pub fn ensure_same_device(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), TensorCompatError> {
    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }
    Ok(())
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

/// Seeded generator when `seed` is set, entropy-seeded otherwise.
#[must_use]
pub fn seedable_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Iterates multi-indices of a shape in row-major order.
#[derive(Debug, Clone)]
pub struct RowMajorIndices {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl RowMajorIndices {
    #[must_use]
    pub fn new(shape: &[usize]) -> Self {
        let next = if shape.contains(&0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        Self {
            shape: shape.to_vec(),
            next,
        }
    }
}

impl Iterator for RowMajorIndices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        let mut dim = self.shape.len();
        let mut carried = true;
        while dim > 0 && carried {
            dim -= 1;
            advanced[dim] += 1;
            if advanced[dim] < self.shape[dim] {
                carried = false;
            } else {
                advanced[dim] = 0;
            }
        }
        if !carried {
            self.next = Some(advanced);
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DType, DenseTensor, Device, RowMajorIndices, TensorMeta, TensorMetaError,
        contiguous_strides, ensure_compatible, seedable_rng,
    };

    #[test]
    fn scalar_meta_is_valid() {
        let meta = TensorMeta::scalar(DType::F64, Device::Cpu);
        assert!(meta.validate().is_ok());
        assert!(meta.shape().is_empty());
        assert_eq!(meta.numel(), 1);
        assert!(meta.is_contiguous());
    }

    #[test]
    fn shape_builds_contiguous_strides() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], DType::F64, Device::Cpu);
        assert_eq!(meta.strides(), &[12, 4, 1]);
        assert_eq!(meta.numel(), 24);
        assert!(meta.is_contiguous());
    }

    #[test]
    fn singleton_dim_stride_variation_is_still_contiguous() {
        let meta = TensorMeta::from_shape_and_strides(
            vec![2, 1, 4],
            vec![4, 99, 1],
            0,
            DType::F64,
            Device::Cpu,
        )
        .expect("interior singleton stride should validate");
        assert!(meta.is_contiguous());
    }

    #[test]
    fn index_rank_and_bounds_are_guarded() {
        let meta = TensorMeta::from_shape(vec![2, 3], DType::F64, Device::Cpu);
        let rank_err = meta
            .storage_index_for(&[1])
            .expect_err("rank mismatch should fail");
        assert!(matches!(
            rank_err,
            TensorMetaError::IndexRankMismatch {
                expected: 2,
                actual: 1
            }
        ));

        let oob_err = meta
            .storage_index_for(&[2, 0])
            .expect_err("out-of-bounds index should fail");
        assert!(matches!(
            oob_err,
            TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: 2,
                size: 2
            }
        ));
    }

    #[test]
    fn transpose_is_a_non_contiguous_view() {
        let tensor = DenseTensor::from_vec(
            (0..6).map(f64::from).collect(),
            vec![2, 3],
            DType::F64,
            Device::Cpu,
        )
        .expect("tensor should build");
        let transposed = tensor.transpose(0, 1).expect("transpose should work");

        assert_eq!(transposed.shape(), &[3, 2]);
        assert!(!transposed.is_contiguous());
        assert!(transposed.meta().is_non_overlapping_and_dense());
        assert_eq!(transposed.storage_id(), tensor.storage_id());
        assert_eq!(transposed.to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn narrow_and_select_offset_into_storage() {
        let tensor = DenseTensor::from_vec(
            (0..12).map(f64::from).collect(),
            vec![4, 3],
            DType::F64,
            Device::Cpu,
        )
        .expect("tensor should build");
        let rows = tensor.narrow(0, 1, 2).expect("narrow should work");
        assert_eq!(rows.shape(), &[2, 3]);
        assert_eq!(rows.to_vec(), vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let column = tensor.select(1, 2).expect("select should work");
        assert_eq!(column.shape(), &[4]);
        assert_eq!(column.to_vec(), vec![2.0, 5.0, 8.0, 11.0]);

        assert!(tensor.narrow(0, 3, 2).is_err());
    }

    #[test]
    fn unsqueeze_inserts_singleton_axis() {
        let tensor = DenseTensor::zeros(vec![2, 3], DType::F32, Device::Cpu);
        let out = tensor.unsqueeze(1).expect("unsqueeze should work");
        assert_eq!(out.shape(), &[2, 1, 3]);
        assert!(out.is_contiguous());
        let trailing = tensor.unsqueeze(2).expect("trailing unsqueeze should work");
        assert_eq!(trailing.shape(), &[2, 3, 1]);
    }

    #[test]
    fn layout_preserving_copy_keeps_transposed_order() {
        let tensor = DenseTensor::from_vec(
            (0..6).map(f64::from).collect(),
            vec![2, 3],
            DType::F64,
            Device::Cpu,
        )
        .expect("tensor should build");
        let transposed = tensor.transpose(0, 1).expect("transpose should work");
        let copy = transposed.layout_preserving_copy();

        assert_ne!(copy.storage_id(), transposed.storage_id());
        assert_eq!(copy.meta().strides(), transposed.meta().strides());
        assert_eq!(copy.to_vec(), transposed.to_vec());
    }

    #[test]
    fn dtype_rounding_matches_precision() {
        assert_eq!(DType::F32.round(0.1), f64::from(0.1f32));
        assert_eq!(DType::I64.round(2.7), 2.0);
        assert_eq!(DType::Bool.round(-3.0), 1.0);
        assert!(DType::F16.eps().expect("f16 has eps") > DType::F32.eps().expect("f32 has eps"));
        assert!(DType::I64.eps().is_none());
    }

    #[test]
    fn seeded_randn_is_reproducible() {
        let mut rng_a = seedable_rng(Some(7));
        let mut rng_b = seedable_rng(Some(7));
        let a = DenseTensor::randn(vec![3, 4], DType::F64, Device::Cpu, &mut rng_a);
        let b = DenseTensor::randn(vec![3, 4], DType::F64, Device::Cpu, &mut rng_b);
        assert_eq!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn randint_respects_bounds() {
        let mut rng = seedable_rng(Some(3));
        let indices = DenseTensor::randint(0, 10, vec![64], Device::Cpu, &mut rng);
        assert_eq!(indices.dtype(), DType::I64);
        assert!(indices.to_vec().iter().all(|&v| (0.0..10.0).contains(&v)));
    }

    #[test]
    fn compatibility_checks_reject_device_mismatch() {
        let lhs = DenseTensor::scalar(1.0, DType::F64, Device::Cpu);
        let rhs = DenseTensor::scalar(2.0, DType::F64, Device::Cuda);
        let err = ensure_compatible(&lhs, &rhs).expect_err("device mismatch must fail");
        assert!(matches!(
            err,
            super::TensorCompatError::DeviceMismatch {
                lhs: Device::Cpu,
                rhs: Device::Cuda
            }
        ));
    }

    #[test]
    fn from_storage_rejects_out_of_bounds_layout() {
        let tensor = DenseTensor::zeros(vec![4], DType::F64, Device::Cpu);
        let meta = TensorMeta::from_shape(vec![5], DType::F64, Device::Cpu);
        let err = DenseTensor::from_storage(tensor.storage().clone(), meta)
            .expect_err("layout larger than storage must fail");
        assert!(matches!(err, TensorMetaError::StorageLengthMismatch { .. }));
    }

    proptest! {
        #[test]
        fn prop_contiguous_stride_contract(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
        }

        #[test]
        fn prop_row_major_indices_cover_numel(shape in prop::collection::vec(1usize..=4, 0..=4)) {
            let count = RowMajorIndices::new(shape.as_slice()).count();
            prop_assert_eq!(count, shape.iter().product::<usize>());
        }

        #[test]
        fn prop_double_transpose_round_trips(rows in 1usize..=5, cols in 1usize..=5) {
            let tensor = DenseTensor::from_vec(
                (0..rows * cols).map(|v| v as f64).collect(),
                vec![rows, cols],
                DType::F64,
                Device::Cpu,
            )
            .expect("tensor should build");
            let back = tensor
                .transpose(0, 1)
                .and_then(|t| t.transpose(0, 1))
                .expect("transpose should work");
            prop_assert_eq!(back.to_vec(), tensor.to_vec());
            prop_assert!(back.is_contiguous());
        }
    }
}
