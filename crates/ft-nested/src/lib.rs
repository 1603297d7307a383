#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ft_core::{DType, DenseTensor, Device, RowMajorIndices, TensorMeta, TensorMetaError};
use rand::Rng;

static NEXT_RAGGED_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NestedError {
    EmptyBatch,
    ScalarComponent,
    ComponentMismatch { detail: String },
    RaggedShapeMismatch { dims: Vec<usize> },
    InvalidOffsets { detail: String },
    InvalidLengths { detail: String },
    ItemOutOfRange { index: usize, batch: usize },
    BatchDimTranspose,
    DimOutOfRange { dim: i64, ndim: usize },
    Meta(TensorMetaError),
}

impl fmt::Display for NestedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBatch => write!(f, "jagged tensor requires at least one component"),
            Self::ScalarComponent => {
                write!(f, "jagged tensor components must have rank >= 1")
            }
            Self::ComponentMismatch { detail } => {
                write!(f, "jagged components are incompatible: {detail}")
            }
            Self::RaggedShapeMismatch { dims } => write!(
                f,
                "jagged layout supports exactly one ragged dim, components vary in dims {dims:?}"
            ),
            Self::InvalidOffsets { detail } => write!(f, "invalid offsets: {detail}"),
            Self::InvalidLengths { detail } => write!(f, "invalid lengths: {detail}"),
            Self::ItemOutOfRange { index, batch } => {
                write!(f, "item {index} out of range for batch of {batch}")
            }
            Self::BatchDimTranspose => {
                write!(f, "transposing the batch dim of a jagged tensor is not supported")
            }
            Self::DimOutOfRange { dim, ndim } => {
                write!(f, "dim {dim} out of range for jagged tensor of rank {ndim}")
            }
            Self::Meta(error) => write!(f, "values layout failure: {error}"),
        }
    }
}

impl std::error::Error for NestedError {}

impl From<TensorMetaError> for NestedError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

/// A dim argument in either its single-dim or dim-list form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimArg {
    Single(i64),
    List(Vec<i64>),
}

/// Batch of variable-length items packed into one values buffer.
///
/// Items are laid out along values dim `ragged_idx - 1`; item `i` spans
/// `[offsets[i], offsets[i] + len_i)` where `len_i` comes from `lengths` when
/// present and from the offsets difference otherwise.
#[derive(Debug, Clone)]
pub struct JaggedTensor {
    values: DenseTensor,
    offsets: Arc<Vec<usize>>,
    lengths: Option<Arc<Vec<usize>>>,
    ragged_idx: usize,
    ragged_id: u64,
    min_seqlen: Option<usize>,
    max_seqlen: Option<usize>,
}

impl JaggedTensor {
    /// Packs components that differ in at most one dim.
    ///
    /// The varying dim becomes the ragged dim; when every component has the
    /// same shape the ragged dim is component dim 0. Min/max seqlen are cached.
    pub fn from_components(components: &[DenseTensor]) -> Result<Self, NestedError> {
        let first = components.first().ok_or(NestedError::EmptyBatch)?;
        Self::check_components(components, first)?;
        let varying = varying_dims(components, first);
        if varying.len() > 1 {
            return Err(NestedError::RaggedShapeMismatch { dims: varying });
        }
        let inner_ragged = varying.first().copied().unwrap_or(0);
        Self::pack(components, first, inner_ragged)
    }

    /// Packs components with component dim `inner_ragged` as the ragged dim.
    ///
    /// Every other dim must agree across components.
    pub fn from_components_along(
        components: &[DenseTensor],
        inner_ragged: usize,
    ) -> Result<Self, NestedError> {
        let first = components.first().ok_or(NestedError::EmptyBatch)?;
        Self::check_components(components, first)?;
        if inner_ragged >= first.rank() {
            return Err(NestedError::DimOutOfRange {
                dim: inner_ragged as i64,
                ndim: first.rank(),
            });
        }
        let varying = varying_dims(components, first);
        if varying.iter().any(|&dim| dim != inner_ragged) {
            return Err(NestedError::RaggedShapeMismatch { dims: varying });
        }
        Self::pack(components, first, inner_ragged)
    }

    fn check_components(
        components: &[DenseTensor],
        first: &DenseTensor,
    ) -> Result<(), NestedError> {
        let rank = first.rank();
        if rank == 0 {
            return Err(NestedError::ScalarComponent);
        }

        for (index, component) in components.iter().enumerate() {
            if component.rank() != rank {
                return Err(NestedError::ComponentMismatch {
                    detail: format!(
                        "component {index} has rank {} but component 0 has rank {rank}",
                        component.rank()
                    ),
                });
            }
            if component.dtype() != first.dtype() || component.device() != first.device() {
                return Err(NestedError::ComponentMismatch {
                    detail: format!(
                        "component {index} is {}/{} but component 0 is {}/{}",
                        component.dtype(),
                        component.device(),
                        first.dtype(),
                        first.device()
                    ),
                });
            }
        }
        Ok(())
    }

    fn pack(
        components: &[DenseTensor],
        first: &DenseTensor,
        inner_ragged: usize,
    ) -> Result<Self, NestedError> {
        let seqlens: Vec<usize> = components
            .iter()
            .map(|component| component.shape()[inner_ragged])
            .collect();
        let mut offsets = Vec::with_capacity(components.len() + 1);
        offsets.push(0usize);
        for len in &seqlens {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + len);
        }
        let total = offsets[offsets.len() - 1];

        let mut values_shape = first.shape().to_vec();
        values_shape[inner_ragged] = total;
        let values_meta = TensorMeta::from_shape(values_shape, first.dtype(), first.device());
        let strides = values_meta.strides().to_vec();
        let mut buffer = vec![0.0; values_meta.numel()];
        for (component, start) in components.iter().zip(offsets.iter()) {
            for (index, value) in RowMajorIndices::new(component.shape()).zip(component.to_vec()) {
                let linear = index
                    .iter()
                    .enumerate()
                    .map(|(dim, &idx)| {
                        let shifted = if dim == inner_ragged { idx + start } else { idx };
                        shifted * strides[dim]
                    })
                    .sum::<usize>();
                buffer[linear] = value;
            }
        }
        let requires_grad = components.iter().any(DenseTensor::requires_grad);
        let values = DenseTensor::from_vec(
            buffer,
            values_meta.shape().to_vec(),
            first.dtype(),
            first.device(),
        )?
        .with_requires_grad(requires_grad);

        Ok(Self {
            values,
            offsets: Arc::new(offsets),
            lengths: None,
            ragged_idx: inner_ragged + 1,
            ragged_id: next_ragged_id(),
            min_seqlen: seqlens.iter().copied().min(),
            max_seqlen: seqlens.iter().copied().max(),
        })
    }

    /// Wraps an existing packed buffer; ragged dim is 1 and no seqlen is cached.
    pub fn from_jagged(
        values: DenseTensor,
        offsets: Vec<usize>,
        lengths: Option<Vec<usize>>,
    ) -> Result<Self, NestedError> {
        if values.rank() == 0 {
            return Err(NestedError::ScalarComponent);
        }
        let extent = values.shape()[0];
        if offsets.len() < 2 {
            return Err(NestedError::InvalidOffsets {
                detail: format!("need at least 2 offsets, got {}", offsets.len()),
            });
        }
        if offsets.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(NestedError::InvalidOffsets {
                detail: format!("offsets must be non-decreasing: {offsets:?}"),
            });
        }
        let last = offsets[offsets.len() - 1];
        if last > extent {
            return Err(NestedError::InvalidOffsets {
                detail: format!("final offset {last} exceeds values extent {extent}"),
            });
        }
        if let Some(lengths) = &lengths {
            let batch = offsets.len() - 1;
            if lengths.len() != batch {
                return Err(NestedError::InvalidLengths {
                    detail: format!("expected {batch} lengths, got {}", lengths.len()),
                });
            }
            for (item, (start, len)) in offsets.iter().zip(lengths.iter()).enumerate() {
                if start + len > extent {
                    return Err(NestedError::InvalidLengths {
                        detail: format!(
                            "item {item} span [{start}, {}) exceeds values extent {extent}",
                            start + len
                        ),
                    });
                }
            }
        }

        Ok(Self {
            values,
            offsets: Arc::new(offsets),
            lengths: lengths.map(Arc::new),
            ragged_idx: 1,
            ragged_id: next_ragged_id(),
            min_seqlen: None,
            max_seqlen: None,
        })
    }

    /// Same ragged structure over a new values buffer of identical shape.
    pub fn with_values(&self, values: DenseTensor) -> Result<Self, NestedError> {
        if values.shape() != self.values.shape() {
            return Err(NestedError::ComponentMismatch {
                detail: format!(
                    "replacement values shape {:?} differs from {:?}",
                    values.shape(),
                    self.values.shape()
                ),
            });
        }
        Ok(Self {
            values,
            ..self.clone()
        })
    }

    pub fn randn_like(&self, rng: &mut impl Rng) -> Self {
        Self {
            values: self.values.randn_like(rng),
            ..self.clone()
        }
    }

    /// Deep copy of the values that keeps the ragged identity.
    #[must_use]
    pub fn clone_detached(&self) -> Self {
        Self {
            values: self
                .values
                .layout_preserving_copy()
                .with_requires_grad(false),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.values = self.values.with_requires_grad(requires_grad);
        self
    }

    #[must_use]
    pub fn values(&self) -> &DenseTensor {
        &self.values
    }

    #[must_use]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    #[must_use]
    pub fn lengths(&self) -> Option<&[usize]> {
        self.lengths.as_deref().map(Vec::as_slice)
    }

    #[must_use]
    pub fn ragged_idx(&self) -> usize {
        self.ragged_idx
    }

    /// Identity of the ragged structure; shared by tensors derived from the same offsets.
    #[must_use]
    pub fn ragged_id(&self) -> u64 {
        self.ragged_id
    }

    #[must_use]
    pub fn min_seqlen(&self) -> Option<usize> {
        self.min_seqlen
    }

    #[must_use]
    pub fn max_seqlen(&self) -> Option<usize> {
        self.max_seqlen
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.values.rank() + 1
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.offsets.len() - 1
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.values.device()
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.values.requires_grad()
    }

    /// Size of an outer dim; `None` for the ragged dim.
    #[must_use]
    pub fn size(&self, dim: usize) -> Option<usize> {
        if dim == 0 {
            Some(self.batch_size())
        } else if dim == self.ragged_idx {
            None
        } else {
            self.values.shape().get(dim - 1).copied()
        }
    }

    #[must_use]
    pub fn shape(&self) -> Vec<Option<usize>> {
        (0..self.rank()).map(|dim| self.size(dim)).collect()
    }

    /// Per-item extent along the ragged dim.
    #[must_use]
    pub fn item_lengths(&self) -> Vec<usize> {
        match &self.lengths {
            Some(lengths) => lengths.to_vec(),
            None => self
                .offsets
                .windows(2)
                .map(|pair| pair[1] - pair[0])
                .collect(),
        }
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.lengths.is_none() && self.values.is_contiguous()
    }

    /// True when some item spans less storage than its offsets imply.
    #[must_use]
    pub fn has_holes(&self) -> bool {
        let Some(lengths) = &self.lengths else {
            return false;
        };
        self.offsets
            .windows(2)
            .zip(lengths.iter())
            .any(|(pair, &len)| len < pair[1] - pair[0])
    }

    /// Item `index` as a view into the values buffer.
    pub fn select(&self, index: usize) -> Result<DenseTensor, NestedError> {
        let batch = self.batch_size();
        if index >= batch {
            return Err(NestedError::ItemOutOfRange { index, batch });
        }
        let start = self.offsets[index];
        let len = match &self.lengths {
            Some(lengths) => lengths[index],
            None => self.offsets[index + 1] - start,
        };
        Ok(self.values.narrow(self.ragged_idx - 1, start, len)?)
    }

    pub fn unbind(&self) -> Result<Vec<DenseTensor>, NestedError> {
        (0..self.batch_size()).map(|index| self.select(index)).collect()
    }

    /// Swaps two non-batch dims without relayout; negative dims count from the end.
    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Self, NestedError> {
        let ndim = self.rank();
        let dim0 = canonicalize_dim(ndim, dim0)?;
        let dim1 = canonicalize_dim(ndim, dim1)?;
        if dim0 == 0 || dim1 == 0 {
            return Err(NestedError::BatchDimTranspose);
        }
        let ragged_idx = if self.ragged_idx == dim0 {
            dim1
        } else if self.ragged_idx == dim1 {
            dim0
        } else {
            self.ragged_idx
        };
        Ok(Self {
            values: self.values.transpose(dim0 - 1, dim1 - 1)?,
            ragged_idx,
            ..self.clone()
        })
    }
}

/// Component dims whose extent differs from `first` in some component.
fn varying_dims(components: &[DenseTensor], first: &DenseTensor) -> Vec<usize> {
    (0..first.rank())
        .filter(|&dim| {
            components
                .iter()
                .any(|component| component.shape()[dim] != first.shape()[dim])
        })
        .collect()
}

/// Same ragged dim and same ragged identity.
#[must_use]
pub fn raggedness_matches(lhs: &JaggedTensor, rhs: &JaggedTensor) -> bool {
    lhs.ragged_idx() == rhs.ragged_idx() && lhs.ragged_id() == rhs.ragged_id()
}

pub fn canonicalize_dim(ndim: usize, dim: i64) -> Result<usize, NestedError> {
    let rank = ndim as i64;
    let wrapped = if dim < 0 { dim + rank } else { dim };
    if wrapped < 0 || wrapped >= rank {
        return Err(NestedError::DimOutOfRange { dim, ndim });
    }
    Ok(wrapped as usize)
}

/// Maps an outer (jagged) dim to the matching dim of a component or values buffer.
///
/// The batch dim and the ragged dim both map to inner dim 0; every other dim
/// shifts down by one. Lists are mapped element-wise and de-duplicated in order.
pub fn outer_to_inner_dim(
    ndim: usize,
    dim: &DimArg,
    canonicalize: bool,
) -> Result<DimArg, NestedError> {
    match dim {
        DimArg::Single(dim) => outer_to_inner_single(ndim, *dim, canonicalize).map(DimArg::Single),
        DimArg::List(dims) => {
            let mut out: Vec<i64> = Vec::with_capacity(dims.len());
            for dim in dims {
                let inner = outer_to_inner_single(ndim, *dim, canonicalize)?;
                if !out.contains(&inner) {
                    out.push(inner);
                }
            }
            Ok(DimArg::List(out))
        }
    }
}

fn outer_to_inner_single(ndim: usize, dim: i64, canonicalize: bool) -> Result<i64, NestedError> {
    let dim = if canonicalize {
        canonicalize_dim(ndim, dim)? as i64
    } else {
        dim
    };
    if dim < 0 || dim >= ndim as i64 {
        return Err(NestedError::DimOutOfRange { dim, ndim });
    }
    Ok(if dim < 2 { 0 } else { dim - 1 })
}

fn next_ragged_id() -> u64 {
    NEXT_RAGGED_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, DenseTensor, Device, seedable_rng};
    use proptest::prelude::*;

    use super::{
        DimArg, JaggedTensor, NestedError, outer_to_inner_dim, raggedness_matches,
    };

    fn ramp(shape: Vec<usize>, start: f64) -> DenseTensor {
        let numel = shape.iter().product::<usize>();
        DenseTensor::from_vec(
            (0..numel).map(|v| start + v as f64).collect(),
            shape,
            DType::F64,
            Device::Cpu,
        )
        .expect("ramp tensor should build")
    }

    #[test]
    fn explicit_ragged_dim_survives_equal_lengths() {
        let nt = JaggedTensor::from_components_along(
            &[ramp(vec![3, 2], 0.0), ramp(vec![3, 2], 10.0)],
            1,
        )
        .expect("uniform components should pack along dim 1");
        assert_eq!(nt.ragged_idx(), 2);
        assert_eq!(nt.offsets(), &[0, 2, 4]);

        let err = JaggedTensor::from_components_along(
            &[ramp(vec![3, 2], 0.0), ramp(vec![4, 2], 10.0)],
            1,
        )
        .expect_err("dim 0 varies but dim 1 was requested");
        assert!(matches!(err, NestedError::RaggedShapeMismatch { .. }));
    }

    #[test]
    fn components_pack_along_ragged_dim() {
        let nt = JaggedTensor::from_components(&[
            ramp(vec![2, 3], 0.0),
            ramp(vec![4, 3], 100.0),
        ])
        .expect("components should pack");

        assert_eq!(nt.rank(), 3);
        assert_eq!(nt.batch_size(), 2);
        assert_eq!(nt.ragged_idx(), 1);
        assert_eq!(nt.offsets(), &[0, 2, 6]);
        assert_eq!(nt.shape(), vec![Some(2), None, Some(3)]);
        assert_eq!(nt.min_seqlen(), Some(2));
        assert_eq!(nt.max_seqlen(), Some(4));
        assert!(nt.is_contiguous());
        assert!(!nt.has_holes());

        let second = nt.select(1).expect("item 1 should exist");
        assert_eq!(second, ramp(vec![4, 3], 100.0));
    }

    #[test]
    fn components_varying_in_two_dims_are_rejected() {
        let err = JaggedTensor::from_components(&[ramp(vec![2, 3], 0.0), ramp(vec![4, 5], 0.0)])
            .expect_err("two ragged dims must fail");
        assert_eq!(err, NestedError::RaggedShapeMismatch { dims: vec![0, 1] });
    }

    #[test]
    fn components_varying_in_trailing_dim_use_that_dim() {
        let nt = JaggedTensor::from_components(&[ramp(vec![3, 2], 0.0), ramp(vec![3, 5], 0.0)])
            .expect("trailing ragged dim should pack");
        assert_eq!(nt.ragged_idx(), 2);
        assert_eq!(nt.select(1).expect("item").shape(), &[3, 5]);
    }

    #[test]
    fn lengths_leave_holes_between_items() {
        let values = ramp(vec![10, 5], 0.0);
        let nt = JaggedTensor::from_jagged(values, vec![0, 2, 4, 10], Some(vec![2, 1, 3]))
            .expect("holed tensor should build");

        assert!(nt.has_holes());
        assert!(!nt.is_contiguous());
        assert_eq!(nt.min_seqlen(), None);
        assert_eq!(nt.item_lengths(), vec![2, 1, 3]);
        let last = nt.select(2).expect("item 2");
        assert_eq!(last.shape(), &[3, 5]);
        assert_eq!(last.get(&[0, 0]).expect("element"), 20.0);
    }

    #[test]
    fn decreasing_offsets_are_rejected() {
        let err = JaggedTensor::from_jagged(ramp(vec![6, 2], 0.0), vec![0, 4, 2], None)
            .expect_err("decreasing offsets must fail");
        assert!(matches!(err, NestedError::InvalidOffsets { .. }));
    }

    #[test]
    fn transpose_keeps_identity_and_moves_ragged_dim() {
        let nt = JaggedTensor::from_components(&[ramp(vec![3, 2, 4], 0.0), ramp(vec![5, 2, 4], 0.0)])
            .expect("components should pack");
        let swapped = nt.transpose(-2, -1).expect("trailing transpose should work");
        assert_eq!(swapped.ragged_idx(), 1);
        assert_eq!(swapped.shape(), vec![Some(2), None, Some(4), Some(2)]);
        assert!(!swapped.is_contiguous());
        assert!(raggedness_matches(&nt, &swapped));
        assert_eq!(
            swapped.select(0).expect("item").to_vec(),
            nt.select(0)
                .and_then(|t| t.transpose(1, 2).map_err(NestedError::from))
                .expect("item")
                .to_vec()
        );

        let three_d = JaggedTensor::from_components(&[ramp(vec![3, 2], 0.0), ramp(vec![5, 2], 0.0)])
            .expect("components should pack");
        let moved = three_d.transpose(-2, -1).expect("transpose should work");
        assert_eq!(moved.ragged_idx(), 2);
        assert!(!raggedness_matches(&three_d, &moved));

        assert_eq!(
            three_d.transpose(0, 1).expect_err("batch transpose must fail"),
            NestedError::BatchDimTranspose
        );
    }

    #[test]
    fn rebuilding_from_jagged_gets_new_identity() {
        let nt = JaggedTensor::from_components(&[ramp(vec![3], 0.0), ramp(vec![4], 0.0)])
            .expect("components should pack");
        let rebuilt = JaggedTensor::from_jagged(
            nt.values().contiguous_copy(),
            nt.offsets().to_vec(),
            None,
        )
        .expect("rebuild should work");
        assert!(!raggedness_matches(&nt, &rebuilt));

        let mut rng = seedable_rng(Some(1));
        assert!(raggedness_matches(&nt, &nt.randn_like(&mut rng)));
        assert!(raggedness_matches(&nt, &nt.clone_detached()));
    }

    #[test]
    fn outer_dims_map_to_inner_space() {
        assert_eq!(
            outer_to_inner_dim(4, &DimArg::Single(-1), true).expect("dim"),
            DimArg::Single(2)
        );
        assert_eq!(
            outer_to_inner_dim(4, &DimArg::Single(1), true).expect("dim"),
            DimArg::Single(0)
        );
        assert_eq!(
            outer_to_inner_dim(4, &DimArg::List(vec![0, 1, 3]), true).expect("dims"),
            DimArg::List(vec![0, 2])
        );
        assert!(outer_to_inner_dim(3, &DimArg::Single(-1), false).is_err());
        assert!(outer_to_inner_dim(3, &DimArg::Single(3), true).is_err());
    }

    proptest! {
        #[test]
        fn prop_unbind_then_pack_round_trips(lengths in prop::collection::vec(1usize..=6, 1..=5), width in 1usize..=4) {
            let components: Vec<DenseTensor> = lengths
                .iter()
                .enumerate()
                .map(|(item, &len)| ramp(vec![len, width], (item * 1000) as f64))
                .collect();
            let nt = JaggedTensor::from_components(&components).expect("components should pack");
            let unbound = nt.unbind().expect("unbind should work");
            let repacked = JaggedTensor::from_components(&unbound).expect("repack should work");

            prop_assert_eq!(repacked.values().to_vec(), nt.values().to_vec());
            prop_assert_eq!(repacked.offsets(), nt.offsets());
            prop_assert_eq!(repacked.item_lengths(), lengths);
        }
    }
}
