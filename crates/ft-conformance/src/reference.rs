use ft_core::{DType, DenseTensor};
use ft_dispatch::{Kwargs, OpInfo, OpKernel, TensorArg, Value, functional_embedding_bag, matmul_op};
use ft_kernel_cpu::{cat, stack};
use ft_nested::{DimArg, JaggedTensor, outer_to_inner_dim, raggedness_matches};

use crate::NjtOpInfoError;
use crate::sample::SampleInput;

/// Reference implementation attached to a jagged op descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceFunc {
    Unbind,
    Reduction,
    Bmm,
    EmbeddingBag,
    Unsupported { op_name: String },
}

impl ReferenceFunc {
    pub fn compute(&self, op: &OpInfo, sample: &SampleInput) -> Result<Value, NjtOpInfoError> {
        match self {
            Self::Unbind => unbind_reference(op, sample),
            Self::Reduction => reduction_reference(op, sample),
            Self::Bmm => reference_bmm(op, sample),
            Self::EmbeddingBag => reference_embedding_bag(op, sample),
            Self::Unsupported { op_name } => Err(NjtOpInfoError::Unsupported {
                op_name: op_name.clone(),
            }),
        }
    }
}

/// Slices one batch item out of `value` when it shares the driving raggedness
/// or carries a batch-axis marker; everything else passes through.
fn slice_item(value: &Value, driving: &JaggedTensor, item: usize) -> Result<Value, NjtOpInfoError> {
    match value {
        Value::Nested(nt) if raggedness_matches(nt, driving) => Ok(Value::tensor(nt.select(item)?)),
        Value::Tensor(TensorArg {
            tensor,
            batch_dim: Some(batch_dim),
        }) => {
            let extent = tensor.shape().get(*batch_dim).copied().ok_or_else(|| {
                NjtOpInfoError::StructuralMismatch {
                    detail: format!(
                        "batch dim {batch_dim} out of range for shape {:?}",
                        tensor.shape()
                    ),
                }
            })?;
            let row = if extent == 1 { 0 } else { item };
            Ok(Value::tensor(tensor.select(*batch_dim, row)?))
        }
        other => Ok(other.clone()),
    }
}

fn slice_value(value: &Value, driving: &JaggedTensor, item: usize) -> Result<Value, NjtOpInfoError> {
    value.try_map_leaves(&mut |leaf| slice_item(leaf, driving, item))
}

/// Per-item index list for an `index_put` whose index tensors address the
/// whole batch.
///
/// With more than one index tensor, the first selects items and the rest
/// are read at this item's position. With a single index tensor, an item it
/// names is written in full and any other item is left untouched.
pub fn index_put_item_indices(
    indices: &Value,
    item_tensor: &DenseTensor,
    item: usize,
) -> Result<Value, NjtOpInfoError> {
    let tensors: Vec<&DenseTensor> = indices
        .as_sequence()
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: format!("index_put indices must be a list, got {}", indices.kind()),
        })?
        .iter()
        .map(|value| {
            value.as_tensor().ok_or_else(|| NjtOpInfoError::StructuralMismatch {
                detail: format!("index_put index must be a tensor, got {}", value.kind()),
            })
        })
        .collect::<Result<_, _>>()?;

    let Some((first, rest)) = tensors.split_first() else {
        return Err(NjtOpInfoError::StructuralMismatch {
            detail: "index_put needs at least one index tensor".to_string(),
        });
    };
    if !rest.is_empty() {
        let per_item = rest
            .iter()
            .map(|index| Ok(Value::tensor(index.select(0, item)?)))
            .collect::<Result<_, NjtOpInfoError>>()?;
        return Ok(Value::List(per_item));
    }

    let named = first.to_vec().into_iter().any(|v| v == item as f64);
    let selection = if named {
        let rows = item_tensor.shape().first().copied().unwrap_or(0);
        DenseTensor::arange(rows, item_tensor.device())
    } else {
        DenseTensor::zeros(vec![0], DType::I64, item_tensor.device())
    };
    Ok(Value::List(vec![Value::tensor(selection)]))
}

/// Runs `op` on each batch item and returns the per-item outputs unwrapped.
pub fn unbind_components(op: &OpInfo, sample: &SampleInput) -> Result<Vec<Value>, NjtOpInfoError> {
    let driving = sample
        .driving_nested()
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: format!(
                "{}: no jagged tensor among input or positional args",
                op.full_name()
            ),
        })?;
    if sample.kwargs.contains_key("dims") {
        return Err(NjtOpInfoError::InvalidCombination {
            detail: format!("{}: per-item decomposition does not translate 'dims'", op.full_name()),
        });
    }
    let inner_dim = match sample.kwargs.get("dim") {
        None | Some(Value::None) => None,
        Some(value) => {
            let dim = value.to_dim_arg().ok_or_else(|| NjtOpInfoError::InvalidCombination {
                detail: format!("{}: dim must be an int or int list, got {}", op.full_name(), value.kind()),
            })?;
            Some(outer_to_inner_dim(driving.rank(), &dim, true)?)
        }
    };

    let mut outputs = Vec::with_capacity(driving.batch_size());
    for item in 0..driving.batch_size() {
        let input = slice_value(&sample.input, driving, item)?;
        let args = sample
            .args
            .iter()
            .map(|arg| slice_value(arg, driving, item))
            .collect::<Result<Vec<_>, _>>()?;
        let mut kwargs = sample
            .kwargs
            .iter()
            .map(|(name, value)| Ok((name.clone(), slice_value(value, driving, item)?)))
            .collect::<Result<Kwargs, NjtOpInfoError>>()?;

        if op.name.contains("index_put") {
            let item_tensor = input.as_tensor().ok_or_else(|| NjtOpInfoError::StructuralMismatch {
                detail: "index_put input must be jagged".to_string(),
            })?;
            if let Some(indices) = sample.kwargs.get("indices") {
                let per_item = index_put_item_indices(indices, item_tensor, item)?;
                kwargs.insert("indices".to_string(), per_item);
            }
        }
        if let Some(dim) = &inner_dim {
            kwargs.insert("dim".to_string(), Value::from(dim.clone()));
        }

        outputs.push(op.call(&input, &args, &kwargs)?);
    }
    Ok(outputs)
}

/// Runs `op` per item and repacks the outputs as jagged tensors.
pub fn unbind_reference(op: &OpInfo, sample: &SampleInput) -> Result<Value, NjtOpInfoError> {
    let driving = sample
        .driving_nested()
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: format!(
                "{}: no jagged tensor among input or positional args",
                op.full_name()
            ),
        })?;
    let outputs = unbind_components(op, sample)?;
    compose(&outputs, driving.ragged_idx() - 1)
}

/// Repacks per-item outputs. Sequence outputs repack position-wise and keep
/// their container kind.
fn compose(outputs: &[Value], preferred_ragged: usize) -> Result<Value, NjtOpInfoError> {
    let Some(first) = outputs.first() else {
        return Err(NjtOpInfoError::StructuralMismatch {
            detail: "no per-item outputs to repack".to_string(),
        });
    };
    match first {
        Value::Tuple(_) | Value::List(_) => {
            let positions = per_position(outputs)?;
            let packed = positions
                .iter()
                .map(|column| pack(column, preferred_ragged).map(Value::Nested))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(match first {
                Value::Tuple(_) => Value::Tuple(packed),
                _ => Value::List(packed),
            })
        }
        _ => {
            let tensors = dense_outputs(outputs)?;
            Ok(Value::Nested(pack(&tensors, preferred_ragged)?))
        }
    }
}

fn pack(components: &[DenseTensor], preferred_ragged: usize) -> Result<JaggedTensor, NjtOpInfoError> {
    let along = components
        .first()
        .is_some_and(|first| preferred_ragged < first.rank());
    if along && let Ok(nt) = JaggedTensor::from_components_along(components, preferred_ragged) {
        return Ok(nt);
    }
    Ok(JaggedTensor::from_components(components)?)
}

fn dense_outputs(outputs: &[Value]) -> Result<Vec<DenseTensor>, NjtOpInfoError> {
    outputs
        .iter()
        .map(|value| {
            value
                .as_tensor()
                .cloned()
                .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
                    detail: format!("per-item output must be a tensor, got {}", value.kind()),
                })
        })
        .collect()
}

/// Transposes K-tuples from each item into K columns of tensors.
fn per_position(outputs: &[Value]) -> Result<Vec<Vec<DenseTensor>>, NjtOpInfoError> {
    let width = outputs
        .first()
        .and_then(Value::as_sequence)
        .map_or(0, <[Value]>::len);
    let mut columns = vec![Vec::with_capacity(outputs.len()); width];
    for (item, output) in outputs.iter().enumerate() {
        let entries = output
            .as_sequence()
            .filter(|entries| entries.len() == width)
            .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
                detail: format!("item {item} output does not have {width} entries"),
            })?;
        for (column, entry) in columns.iter_mut().zip(entries) {
            column.extend(dense_outputs(std::slice::from_ref(entry))?);
        }
    }
    Ok(columns)
}

fn map_tensors(
    value: Value,
    f: &mut impl FnMut(&DenseTensor) -> Result<DenseTensor, NjtOpInfoError>,
) -> Result<Value, NjtOpInfoError> {
    value.try_map_leaves(&mut |leaf| match leaf {
        Value::Tensor(arg) => Ok(Value::tensor(f(&arg.tensor)?)),
        other => Err(NjtOpInfoError::StructuralMismatch {
            detail: format!("reduction output must be a tensor, got {}", other.kind()),
        }),
    })
}

/// Reference for reductions over a jagged batch.
///
/// * no dim: reduce the packed values directly;
/// * batch and ragged dims together: reduce the packed values over the
///   corresponding values dims;
/// * ragged dim without the batch dim: reduce per item and stack;
/// * other dims only: the per-item decomposition.
pub fn reduction_reference(op: &OpInfo, sample: &SampleInput) -> Result<Value, NjtOpInfoError> {
    let nt = sample
        .input
        .as_nested()
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: format!("{}: reduction input must be jagged", op.full_name()),
        })?;
    if sample.kwargs.contains_key("dims") {
        return Err(NjtOpInfoError::InvalidCombination {
            detail: format!("{}: reductions take 'dim', not 'dims'", op.full_name()),
        });
    }
    if nt.ragged_idx() != 1 {
        return Err(NjtOpInfoError::InvalidCombination {
            detail: format!(
                "{}: reduction reference needs the ragged dim at 1, got {}",
                op.full_name(),
                nt.ragged_idx()
            ),
        });
    }
    let keepdim = matches!(sample.kwargs.get("keepdim"), Some(Value::Bool(true)));
    let dims = match sample.kwargs.get("dim") {
        None | Some(Value::None) => None,
        Some(value) => Some(value.to_dim_arg().ok_or_else(|| {
            NjtOpInfoError::InvalidCombination {
                detail: format!("{}: dim must be an int or int list, got {}", op.full_name(), value.kind()),
            }
        })?),
    };
    let Some(dims) = dims else {
        let values = Value::tensor(nt.values().clone());
        return Ok(op.call(&values, &sample.args, &sample.kwargs)?);
    };

    let outer: Vec<usize> = match &dims {
        DimArg::Single(dim) => vec![ft_nested::canonicalize_dim(nt.rank(), *dim)?],
        DimArg::List(list) => list
            .iter()
            .map(|&dim| ft_nested::canonicalize_dim(nt.rank(), dim))
            .collect::<Result<_, _>>()?,
    };
    let on_batch = outer.contains(&0);
    let on_ragged = outer.contains(&nt.ragged_idx());

    match (on_batch, on_ragged) {
        (true, true) => {
            let inner = outer_to_inner_dim(nt.rank(), &dims, true)?;
            let mut kwargs = sample.kwargs.clone();
            kwargs.insert("dim".to_string(), Value::from(inner));
            let values = Value::tensor(nt.values().clone());
            let out = op.call(&values, &sample.args, &kwargs)?;
            if keepdim {
                let ragged = nt.ragged_idx();
                map_tensors(out, &mut |tensor| Ok(tensor.unsqueeze(ragged)?))
            } else {
                Ok(out)
            }
        }
        (true, false) => Err(NjtOpInfoError::InvalidCombination {
            detail: format!(
                "{}: reducing the batch dim without the ragged dim is unsupported",
                op.full_name()
            ),
        }),
        (false, true) => {
            if outer.len() > 1 {
                return Err(NjtOpInfoError::InvalidCombination {
                    detail: format!(
                        "{}: reducing the ragged dim together with other non-batch dims is unsupported",
                        op.full_name()
                    ),
                });
            }
            let outputs = unbind_components(op, sample)?;
            stack_outputs(&outputs)
        }
        (false, false) => unbind_reference(op, sample),
    }
}

fn stack_outputs(outputs: &[Value]) -> Result<Value, NjtOpInfoError> {
    match outputs.first() {
        Some(first @ (Value::Tuple(_) | Value::List(_))) => {
            let stacked = per_position(outputs)?
                .iter()
                .map(|column| Ok(Value::tensor(stack(column, 0)?)))
                .collect::<Result<Vec<_>, NjtOpInfoError>>()?;
            Ok(match first {
                Value::Tuple(_) => Value::Tuple(stacked),
                _ => Value::List(stacked),
            })
        }
        _ => Ok(Value::tensor(stack(&dense_outputs(outputs)?, 0)?)),
    }
}

/// Batched matrix product checked through the per-item matmul.
pub fn reference_bmm(op: &OpInfo, sample: &SampleInput) -> Result<Value, NjtOpInfoError> {
    let matmul = op.with_op(OpKernel::Custom {
        name: "matmul",
        call: matmul_op,
    });
    let mut renamed = sample.clone();
    let other = renamed
        .kwargs
        .remove("mat2")
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: format!("{}: sample lacks mat2", op.full_name()),
        })?;
    renamed.kwargs.insert("other".to_string(), other);
    unbind_reference(&matmul, &renamed)
}

/// One bag per batch item: each item's indices form a single bag, and the
/// per-item bag rows concatenate into a dense (B, D) result.
pub fn reference_embedding_bag(op: &OpInfo, sample: &SampleInput) -> Result<Value, NjtOpInfoError> {
    let Some(indices) = sample.args.first() else {
        return Err(NjtOpInfoError::StructuralMismatch {
            detail: format!("{}: sample lacks jagged indices", op.full_name()),
        });
    };
    let device = indices
        .as_nested()
        .map(JaggedTensor::device)
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: format!("{}: indices must be jagged, got {}", op.full_name(), indices.kind()),
        })?;
    let functional = op.with_op(OpKernel::Custom {
        name: "embedding_bag",
        call: functional_embedding_bag,
    });
    let mut kwargs = sample.kwargs.clone();
    kwargs.insert(
        "offsets".to_string(),
        Value::tensor(DenseTensor::zeros(vec![1], DType::I64, device)),
    );
    let flipped = SampleInput {
        input: indices.clone(),
        args: vec![sample.input.clone()],
        kwargs,
        name: sample.name.clone(),
    };
    let rows = dense_outputs(&unbind_components(&functional, &flipped)?)?;
    Ok(Value::tensor(cat(&rows, 0)?))
}
