use std::iter;

use ft_core::{DType, DenseTensor, Device, MemoryFormat};
use ft_dispatch::{Kwargs, OpInfo, Value};
use ft_nested::JaggedTensor;
use rand::rngs::StdRng;

use crate::NjtOpInfoError;
use crate::sample::{
    Contiguity, NjtSampler, PerBatch, SampleContext, SampleInput, SampleResult,
    random_nt_from_dims, sample_njts,
};

pub type SampleIter = Box<dyn Iterator<Item = SampleResult>>;

/// Sample-input generator attached to a jagged op descriptor.
#[derive(Debug, Clone)]
pub enum SampleInputsFunc {
    ElementwiseUnary { op_kwargs: Kwargs },
    ElementwiseBinary { op_kwargs: Kwargs },
    Reduction { supports_dimlist: bool, op_kwargs: Kwargs },
    Clone,
    To,
    Bmm,
    Matmul,
    MaskedSelect,
    Embedding,
    EmbeddingBag,
    IndexPut,
    Linear,
    RmsNorm,
    Unsupported { op_name: String },
}

impl SampleInputsFunc {
    #[must_use]
    pub fn elementwise_unary() -> Self {
        Self::ElementwiseUnary {
            op_kwargs: Kwargs::new(),
        }
    }

    #[must_use]
    pub fn unary_with(pairs: &[(&str, Value)]) -> Self {
        Self::ElementwiseUnary {
            op_kwargs: pairs
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn elementwise_binary() -> Self {
        Self::ElementwiseBinary {
            op_kwargs: Kwargs::new(),
        }
    }

    #[must_use]
    pub fn reduction(supports_dimlist: bool) -> Self {
        Self::Reduction {
            supports_dimlist,
            op_kwargs: Kwargs::new(),
        }
    }

    /// Starts generation. Unsupported ops and rejected context settings fail
    /// here, before any sample is drawn.
    pub fn generate(&self, _op: &OpInfo, ctx: &SampleContext) -> Result<SampleIter, NjtOpInfoError> {
        match self {
            Self::ElementwiseUnary { op_kwargs } => Ok(elementwise_unary(ctx, op_kwargs.clone())),
            Self::ElementwiseBinary { op_kwargs } => elementwise_binary(ctx, op_kwargs.clone()),
            Self::Reduction {
                supports_dimlist,
                op_kwargs,
            } => Ok(reduction(ctx, *supports_dimlist, op_kwargs.clone())),
            Self::Clone => Ok(clone_samples(ctx)),
            Self::To => Ok(to_samples(ctx)),
            Self::Bmm => Ok(bmm_samples(ctx)),
            Self::Matmul => Ok(matmul_samples(ctx)),
            Self::MaskedSelect => Ok(masked_select_samples(ctx)),
            Self::Embedding => Ok(embedding_samples(ctx)),
            Self::EmbeddingBag => Ok(embedding_bag_samples(ctx)),
            Self::IndexPut => Ok(index_put_samples(ctx)),
            Self::Linear => Ok(linear_samples(ctx)),
            Self::RmsNorm => Ok(rms_norm_samples(ctx)),
            Self::Unsupported { op_name } => Err(NjtOpInfoError::Unsupported {
                op_name: op_name.clone(),
            }),
        }
    }
}

/// Runs a one-shot builder on first pull.
fn deferred<F>(build: F) -> impl Iterator<Item = SampleResult>
where
    F: FnOnce() -> Result<Vec<SampleInput>, NjtOpInfoError>,
{
    iter::once(build).flat_map(|build| match build() {
        Ok(samples) => samples.into_iter().map(Ok).collect::<Vec<_>>(),
        Err(error) => vec![Err(error)],
    })
}

fn collect_batch<F>(build: F) -> Vec<SampleResult>
where
    F: FnOnce() -> Result<Vec<SampleInput>, NjtOpInfoError>,
{
    match build() {
        Ok(samples) => samples.into_iter().map(Ok).collect(),
        Err(error) => vec![Err(error)],
    }
}

fn fixed_trailing(nt: &JaggedTensor, from: usize) -> Result<Vec<usize>, NjtOpInfoError> {
    nt.shape()[from..]
        .iter()
        .copied()
        .collect::<Option<Vec<usize>>>()
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: format!("batch with ragged dim {} has no fixed trailing shape", nt.ragged_idx()),
        })
}

fn last_extent(nt: &JaggedTensor) -> Result<usize, NjtOpInfoError> {
    nt.size(nt.rank() - 1)
        .ok_or_else(|| NjtOpInfoError::StructuralMismatch {
            detail: "last dim of the batch is ragged".to_string(),
        })
}

/// Every rank in the requested layout, or in every layout when none is set,
/// each with the same keyword args.
pub fn elementwise_unary(ctx: &SampleContext, op_kwargs: Kwargs) -> SampleIter {
    let ctx = *ctx;
    let layouts = [
        Contiguity::Contig,
        Contiguity::NoncontigHoles,
        Contiguity::NoncontigTransposed,
    ];
    Box::new(
        layouts
            .into_iter()
            .zip(0u64..)
            .filter(move |(contiguity, _)| ctx.contiguity.is_none_or(|only| only == *contiguity))
            .flat_map(move |(contiguity, stream)| {
                let op_kwargs = op_kwargs.clone();
                sample_njts(&ctx, contiguity, ctx.rng(stream)).map(move |nt| {
                    let nt = nt?;
                    let name = format!("{}D: {contiguity}", nt.rank());
                    Ok(SampleInput::new(nt)
                        .with_kwargs(op_kwargs.clone())
                        .with_name(name))
                })
            }),
    )
}

/// Pairs of (jagged, jagged) and (jagged, dense) operands under broadcasting.
pub fn elementwise_binary(
    ctx: &SampleContext,
    op_kwargs: Kwargs,
) -> Result<SampleIter, NjtOpInfoError> {
    if let Some(dim_type) = ctx.dim_type {
        return Err(NjtOpInfoError::InvalidCombination {
            detail: format!("binary elementwise samples take no dim type, got {dim_type}"),
        });
    }
    let ctx = *ctx;
    let batch_kwargs = op_kwargs.clone();
    let per_batch = PerBatch::new(
        sample_njts(&ctx, Contiguity::Contig, ctx.rng(0)),
        move |nt, rng| collect_batch(|| binary_samples_for(&ctx, nt, &batch_kwargs, rng)),
    );
    let mixed = deferred(move || mixed_broadcast_samples(&ctx, &op_kwargs, &mut ctx.rng(1)));
    Ok(Box::new(per_batch.chain(mixed)))
}

fn both_orders(
    nt: &JaggedTensor,
    dense: Value,
    op_kwargs: &Kwargs,
    label: &str,
) -> [SampleInput; 2] {
    let rank = nt.rank();
    [
        SampleInput::new(nt.clone())
            .with_args(vec![dense.clone()])
            .with_kwargs(op_kwargs.clone())
            .with_name(format!("{rank}D: NT, T {label}")),
        SampleInput::new(dense)
            .with_args(vec![Value::Nested(nt.clone())])
            .with_kwargs(op_kwargs.clone())
            .with_name(format!("{rank}D: T, NT {label}")),
    ]
}

fn binary_samples_for(
    ctx: &SampleContext,
    nt: JaggedTensor,
    op_kwargs: &Kwargs,
    rng: &mut StdRng,
) -> Result<Vec<SampleInput>, NjtOpInfoError> {
    let rank = nt.rank();
    let batch = nt.batch_size();
    let trailing = fixed_trailing(&nt, 2)?;
    let mut samples = Vec::with_capacity(9);

    let other = nt.randn_like(rng);
    samples.push(
        SampleInput::new(nt.clone())
            .with_args(vec![Value::Nested(other)])
            .with_kwargs(op_kwargs.clone())
            .with_name(format!("{rank}D: NT, NT")),
    );

    let mut ragged_broadcast = vec![batch, 1];
    ragged_broadcast.extend(&trailing);
    let dense = Value::batched(ctx.randn_param(ragged_broadcast, rng), 0);
    samples.extend(both_orders(&nt, dense, op_kwargs, "broadcasting 1 over ragged dim"));

    let dense = Value::batched(ctx.randn_param(vec![1; rank], rng), 0);
    samples.extend(both_orders(&nt, dense, op_kwargs, "broadcasting all 1s"));

    let dense = Value::tensor(ctx.randn_param(trailing, rng));
    samples.extend(both_orders(&nt, dense, op_kwargs, "broadcasting normal dims"));

    let dense = Value::tensor(ctx.randn_param(Vec::new(), rng));
    samples.extend(both_orders(&nt, dense, op_kwargs, "with scalar"));

    Ok(samples)
}

/// A size-1 jagged trailing dim broadcast against a batch-marked dense operand.
fn mixed_broadcast_samples(
    ctx: &SampleContext,
    op_kwargs: &Kwargs,
    rng: &mut StdRng,
) -> Result<Vec<SampleInput>, NjtOpInfoError> {
    let (batch, width) = (4, 16);
    let nt = random_nt_from_dims(&[Some(batch), None, Some(1)], ctx, rng)?;
    let dense = Value::batched(ctx.randn_param(vec![batch, 1, width], rng), 0);
    Ok(both_orders(&nt, dense, op_kwargs, "mixed broadcasting").into())
}

/// Single dims, optional dim lists and a full reduction per batch.
pub fn reduction(ctx: &SampleContext, supports_dimlist: bool, op_kwargs: Kwargs) -> SampleIter {
    let contiguity = ctx.contiguity.unwrap_or(Contiguity::Contig);
    Box::new(PerBatch::new(
        sample_njts(ctx, contiguity, ctx.rng(0)),
        move |nt, _rng| {
            reduction_samples_for(&nt, supports_dimlist, &op_kwargs)
                .into_iter()
                .map(Ok)
                .collect()
        },
    ))
}

fn reduction_samples_for(
    nt: &JaggedTensor,
    supports_dimlist: bool,
    op_kwargs: &Kwargs,
) -> Vec<SampleInput> {
    let rank = nt.rank();
    let ragged = nt.ragged_idx();
    let dim_sample = |dim: Value, keepdim: bool, label: String| {
        SampleInput::new(nt.clone_detached())
            .with_kwargs(op_kwargs.clone())
            .with_kwarg("dim", dim)
            .with_kwarg("keepdim", Value::Bool(keepdim))
            .with_name(format!("{rank}D: {label} keepdim={keepdim}"))
    };

    let mut samples = Vec::new();
    for keepdim in [false, true] {
        for dim in 1..rank {
            samples.push(dim_sample(Value::Int(dim as i64), keepdim, format!("dim={dim}")));
        }
        if !supports_dimlist {
            continue;
        }
        let mut lists = vec![vec![0, ragged]];
        lists.extend((ragged + 1..rank).map(|other| vec![0, ragged, other]));
        if rank > 3 && ragged == 1 {
            lists.push(vec![rank - 2, rank - 1]);
        }
        lists.push((0..rank).collect());
        for dims in lists {
            let label = format!("dim={dims:?}");
            let dims = dims.into_iter().map(|dim| dim as i64).collect();
            samples.push(dim_sample(Value::IntList(dims), keepdim, label));
        }
    }

    samples.push(
        SampleInput::new(nt.clone_detached())
            .with_kwargs(op_kwargs.clone())
            .with_name(format!("{rank}D: full reduction")),
    );
    samples
}

/// Default batches, then a holed batch under each memory format.
pub fn clone_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    let defaults = PerBatch::new(
        sample_njts(&ctx, Contiguity::Contig, ctx.rng(0)),
        |nt, _rng| {
            let name = format!("{}D", nt.rank());
            vec![Ok(SampleInput::new(nt).with_name(name))]
        },
    );
    let holed = deferred(move || {
        let mut rng = ctx.rng(1);
        [MemoryFormat::Contiguous, MemoryFormat::Preserve]
            .into_iter()
            .map(|memory_format| {
                let values = ctx.randn_param(vec![10, 5], &mut rng);
                let nt = JaggedTensor::from_jagged(values, vec![0, 2, 4, 10], Some(vec![2, 1, 3]))?;
                Ok(SampleInput::new(nt)
                    .with_kwarg("memory_format", Value::MemoryFormat(memory_format))
                    .with_name(format!("3D: holes {memory_format:?}")))
            })
            .collect()
    });
    Box::new(defaults.chain(holed))
}

/// A dtype conversion to every other float dtype, plus a device move off CUDA.
pub fn to_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    Box::new(PerBatch::new(
        sample_njts(&ctx, Contiguity::Contig, ctx.rng(0)),
        move |nt, _rng| {
            let rank = nt.rank();
            let mut samples: Vec<SampleResult> = [DType::F32, DType::F16, DType::F64]
                .into_iter()
                .filter(|other| *other != ctx.dtype)
                .map(|other| {
                    Ok(SampleInput::new(nt.clone())
                        .with_kwarg("dtype", Value::DType(other))
                        .with_name(format!("{rank}D: {} -> {other}", ctx.dtype)))
                })
                .collect();
            if ctx.device == Device::Cuda {
                samples.push(Ok(SampleInput::new(nt)
                    .with_kwarg("device", Value::Device(Device::Cpu))
                    .with_name(format!("{rank}D: {} -> {}", Device::Cuda, Device::Cpu))));
            }
            samples
        },
    ))
}

fn bmm_sample_for(
    ctx: &SampleContext,
    nt: &JaggedTensor,
    rng: &mut StdRng,
) -> Result<SampleInput, NjtOpInfoError> {
    let batch = nt.batch_size();
    let inner = last_extent(nt)?;
    let other = ctx.randn_param(vec![batch, inner, inner + 2], rng);
    Ok(SampleInput::new(nt.clone_detached())
        .with_kwarg("mat2", Value::batched(other, 0))
        .with_name(format!("3D: NT @ T ({batch}, {inner}, {})", inner + 2)))
}

/// Rank-3 batches against a batch-marked dense (B, D, D + 2) operand.
pub fn bmm_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    Box::new(PerBatch::new(
        NjtSampler::new(ctx, vec![3], Contiguity::Contig, ctx.rng(0)),
        move |nt, rng| vec![bmm_sample_for(&ctx, &nt, rng)],
    ))
}

/// The bmm samples as `other`, then unbatched dense operands at ranks 3 and 4.
pub fn matmul_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    let batched = bmm_samples(&ctx).map(|sample| {
        let mut sample = sample?;
        let other = sample.kwargs.remove("mat2").ok_or_else(|| {
            NjtOpInfoError::StructuralMismatch {
                detail: "bmm sample lacks mat2".to_string(),
            }
        })?;
        sample.kwargs.insert("other".to_string(), other);
        Ok(sample)
    });
    let unbatched = move |rank: usize, stream: u64| {
        PerBatch::new(
            NjtSampler::new(ctx, vec![rank], Contiguity::Contig, ctx.rng(stream)),
            move |nt, rng| {
                let sample = last_extent(&nt).map(|inner| {
                    let other = ctx.randn_param(vec![inner, inner + 2], rng);
                    SampleInput::new(nt.clone_detached())
                        .with_kwarg("other", Value::tensor(other))
                        .with_name(format!("{rank}D: NT @ T ({inner}, {})", inner + 2))
                });
                vec![sample]
            },
        )
    };
    Box::new(batched.chain(unbatched(3, 1)).chain(unbatched(4, 2)))
}

fn masked_sample_for(
    nt: &JaggedTensor,
    rng: &mut StdRng,
) -> Result<SampleInput, NjtOpInfoError> {
    let draw = nt.values().randn_like(rng);
    let mask_values = DenseTensor::from_vec(
        draw.to_vec()
            .into_iter()
            .map(|v| if v < 0.0 { 1.0 } else { 0.0 })
            .collect(),
        draw.shape().to_vec(),
        DType::Bool,
        draw.device(),
    )?;
    let mask = nt.with_values(mask_values)?;
    Ok(SampleInput::new(nt.clone())
        .with_kwarg("mask", Value::Nested(mask))
        .with_name(format!("{}D: masked", nt.rank())))
}

/// Rank-2 batches with a boolean mask of identical raggedness.
pub fn masked_select_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    Box::new(PerBatch::new(
        NjtSampler::new(ctx, vec![2], Contiguity::Contig, ctx.rng(0)),
        |nt, rng| vec![masked_sample_for(&nt, rng)],
    ))
}

fn index_batch(rows: &[&[i64]], device: Device) -> Result<JaggedTensor, NjtOpInfoError> {
    let components = rows
        .iter()
        .map(|row| {
            DenseTensor::from_vec(
                row.iter().map(|&v| v as f64).collect(),
                vec![row.len()],
                DType::I64,
                device,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(JaggedTensor::from_components(&components)?)
}

/// A dense weight table looked up through jagged indices, with and without padding.
pub fn embedding_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    Box::new(deferred(move || {
        let mut rng = ctx.rng(0);
        let indices = index_batch(&[&[0, 2, 1, 3], &[4, 2, 1], &[6, 7, 5, 2, 4]], ctx.device)?;
        let weight = ctx.randn(vec![20, 32], &mut rng).with_requires_grad(true);
        let base = SampleInput::new(weight).with_args(vec![Value::Nested(indices)]);
        Ok(vec![
            base.clone().with_name("2D: lookup"),
            base.with_kwarg("padding_idx", Value::Int(1))
                .with_name("2D: lookup padding_idx=1"),
        ])
    }))
}

/// Bag reductions over jagged indices; per-sample weights only with `sum`.
pub fn embedding_bag_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    Box::new(deferred(move || {
        let mut rng = ctx.rng(0);
        let mut samples = Vec::new();
        for with_weights in [true, false] {
            for mode in ["sum", "mean", "max"] {
                if with_weights && mode != "sum" {
                    continue;
                }
                let weight = ctx.randn_param(vec![10, 32], &mut rng);
                let components: Vec<DenseTensor> = [2, 3, 4]
                    .into_iter()
                    .map(|len| DenseTensor::randint(0, 10, vec![len], ctx.device, &mut rng))
                    .collect();
                let indices = JaggedTensor::from_components(&components)?;
                let per_sample_weights = if with_weights {
                    let draw = ctx.randn_param(indices.values().shape().to_vec(), &mut rng);
                    Value::Nested(indices.with_values(draw)?)
                } else {
                    Value::None
                };
                samples.push(
                    SampleInput::new(weight)
                        .with_args(vec![Value::Nested(indices)])
                        .with_kwarg("mode", Value::Str(mode.to_string()))
                        .with_kwarg("per_sample_weights", per_sample_weights)
                        .with_name(format!("bags mode={mode} weighted={with_weights}")),
                );
            }
        }
        Ok(samples)
    }))
}

/// Per rank, writes through the batch dim and successively deeper dims.
pub fn index_put_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    let per_batch = PerBatch::new(
        sample_njts(&ctx, Contiguity::Contig, ctx.rng(0)),
        move |nt, _rng| {
            let rank = nt.rank();
            let batch = nt.batch_size();
            (0..rank)
                .map(|dim| {
                    let mut indices = vec![Value::tensor(DenseTensor::arange(batch, ctx.device))];
                    for _ in 1..dim {
                        indices.push(Value::tensor(DenseTensor::zeros(
                            vec![batch],
                            DType::I64,
                            ctx.device,
                        )));
                    }
                    Ok(SampleInput::new(nt.clone_detached())
                        .with_kwarg("indices", Value::List(indices))
                        .with_kwarg(
                            "values",
                            Value::tensor(DenseTensor::scalar(1.0, ctx.dtype, ctx.device)),
                        )
                        .with_name(format!("{rank}D: index_put through dim {dim}")))
                })
                .collect()
        },
    );
    let holed = deferred(move || {
        let values = DenseTensor::zeros(vec![7, 3], ctx.dtype, ctx.device)
            .with_requires_grad(ctx.requires_grad);
        let nt = JaggedTensor::from_jagged(values, vec![0, 2, 5, 7], Some(vec![2, 2, 2]))?;
        let index = |row: &[i64]| {
            DenseTensor::from_vec(
                row.iter().map(|&v| v as f64).collect(),
                vec![row.len()],
                DType::I64,
                ctx.device,
            )
            .map(Value::tensor)
        };
        let indices = vec![index(&[0, 1, 2])?, index(&[0, 1, 1])?, index(&[0, 0, 0])?];
        Ok(vec![SampleInput::new(nt)
            .with_kwarg("indices", Value::List(indices))
            .with_kwarg(
                "values",
                Value::tensor(DenseTensor::scalar(1.0, ctx.dtype, ctx.device)),
            )
            .with_name("3D: index_put into holes")])
    });
    Box::new(per_batch.chain(holed))
}

/// Ranks 3 to 5 against a (10, D) weight, with and without bias.
pub fn linear_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    Box::new(PerBatch::new(
        NjtSampler::new(ctx, vec![3, 4, 5], Contiguity::Contig, ctx.rng(0)),
        move |nt, rng| {
            collect_batch(|| {
                let rank = nt.rank();
                let inner = last_extent(&nt)?;
                let mut samples = Vec::with_capacity(2);
                for with_bias in [true, false] {
                    let weight = ctx.randn_param(vec![10, inner], rng);
                    let bias = if with_bias {
                        Value::tensor(ctx.randn_param(vec![10], rng))
                    } else {
                        Value::None
                    };
                    samples.push(
                        SampleInput::new(nt.clone_detached())
                            .with_kwarg("weight", Value::tensor(weight))
                            .with_kwarg("bias", bias)
                            .with_name(format!("{rank}D: linear bias={with_bias}")),
                    );
                }
                Ok(samples)
            })
        },
    ))
}

/// Normalizes over every trailing suffix that excludes the ragged dim.
pub fn rms_norm_samples(ctx: &SampleContext) -> SampleIter {
    let ctx = *ctx;
    Box::new(PerBatch::new(
        NjtSampler::new(ctx, vec![3, 4], Contiguity::Contig, ctx.rng(0)),
        move |nt, rng| {
            collect_batch(|| {
                let rank = nt.rank();
                (2..rank)
                    .map(|start| {
                        let normalized = fixed_trailing(&nt, start)?;
                        let weight = ctx.randn_param(normalized.clone(), rng);
                        let shape = normalized.iter().map(|&extent| extent as i64).collect();
                        Ok(SampleInput::new(nt.clone_detached())
                            .with_kwarg("normalized_shape", Value::IntList(shape))
                            .with_kwarg("weight", Value::tensor(weight))
                            .with_name(format!("{rank}D: normalize from dim {start}")))
                    })
                    .collect()
            })
        },
    ))
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, Device};
    use ft_dispatch::{Value, find_op};

    use super::{SampleInputsFunc, elementwise_binary, reduction};
    use crate::NjtOpInfoError;
    use crate::sample::{Contiguity, DimType, SampleContext, SampleInput};

    fn ctx() -> SampleContext {
        SampleContext::new(Device::Cpu, DType::F32, false).with_seed(Some(5))
    }

    fn collect(iter: super::SampleIter) -> Vec<SampleInput> {
        iter.collect::<Result<_, _>>()
            .expect("samples should generate")
    }

    #[test]
    fn unary_samples_cover_every_layout() {
        let samples = collect(super::elementwise_unary(&ctx(), Default::default()));
        // 2 contig per rank, 1 holed per rank, transposed for ranks 3 and 4
        assert_eq!(samples.len(), 6 + 3 + 2);
        let names: Vec<&str> = samples.iter().map(SampleInput::label).collect();
        assert_eq!(names[0], "2D: contig");
        assert!(names.contains(&"3D: noncontig_holes"));
        assert!(names.contains(&"4D: noncontig_transposed"));
        assert!(samples.iter().all(|s| s.input.is_nested()));
    }

    #[test]
    fn unary_samples_follow_requested_layout() {
        for layout in Contiguity::ALL {
            let samples = collect(super::elementwise_unary(
                &ctx().with_contiguity(Some(layout)),
                Default::default(),
            ));
            assert!(!samples.is_empty());
            for sample in &samples {
                let nt = sample.input.as_nested().expect("jagged input");
                assert_eq!(Contiguity::of(nt), layout, "{}", sample.label());
            }
        }
    }

    #[test]
    fn binary_samples_pair_each_batch_in_both_orders() {
        let samples = collect(elementwise_binary(&ctx(), Default::default()).expect("no dim type"));
        // 6 contig batches x 9 samples + 2 mixed
        assert_eq!(samples.len(), 6 * 9 + 2);
        for sample in &samples {
            assert_eq!(sample.args.len(), 1);
            assert!(sample.input.is_nested() || sample.args[0].is_nested());
        }
    }

    #[test]
    fn binary_batch_marked_operands_broadcast_per_item() {
        let samples = collect(elementwise_binary(&ctx(), Default::default()).expect("no dim type"));
        for sample in samples {
            let nt = sample.driving_nested().expect("one operand is jagged").clone();
            let dense = [&sample.input, &sample.args[0]]
                .into_iter()
                .find_map(|value| match value {
                    Value::Tensor(arg) => Some(arg.clone()),
                    _ => None,
                });
            let Some(arg) = dense else { continue };
            let Some(bdim) = arg.batch_dim else { continue };
            for (i, item) in nt.unbind().expect("unbind").iter().enumerate() {
                let row = if arg.tensor.shape()[bdim] == 1 { 0 } else { i };
                let slice = arg.tensor.select(bdim, row).expect("slice");
                assert!(
                    ft_kernel_cpu::broadcast_shapes(item.shape(), slice.shape()).is_ok(),
                    "{}: item {i} {:?} vs {:?}",
                    sample.label(),
                    item.shape(),
                    slice.shape()
                );
            }
        }
    }

    #[test]
    fn binary_rejects_dim_type() {
        let ctx = ctx().with_dim_type(Some(DimType::RaggedDim));
        let err = elementwise_binary(&ctx, Default::default()).err().expect("dim type rejected");
        assert!(matches!(err, NjtOpInfoError::InvalidCombination { .. }));
    }

    #[test]
    fn reduction_samples_never_target_batch_dim_alone() {
        let samples = collect(reduction(&ctx(), true, Default::default()));
        let mut full = 0;
        for sample in &samples {
            match sample.kwargs.get("dim") {
                Some(Value::Int(dim)) => assert_ne!(*dim, 0),
                Some(Value::IntList(dims)) => {
                    if dims.contains(&0) {
                        let nt = sample.input.as_nested().expect("jagged input");
                        assert!(dims.contains(&(nt.ragged_idx() as i64)));
                    }
                }
                Some(other) => panic!("unexpected dim {other:?}"),
                None => full += 1,
            }
        }
        assert_eq!(full, 6);
    }

    #[test]
    fn reduction_dimlists_follow_the_rank() {
        let samples = collect(reduction(&ctx(), true, Default::default()));
        let rank4_lists: Vec<Vec<i64>> = samples
            .iter()
            .filter(|s| s.input.as_nested().is_some_and(|nt| nt.rank() == 4))
            .filter(|s| matches!(s.kwargs.get("keepdim"), Some(Value::Bool(false))))
            .filter_map(|s| match s.kwargs.get("dim") {
                Some(Value::IntList(dims)) => Some(dims.clone()),
                _ => None,
            })
            .take(5)
            .collect();
        assert_eq!(
            rank4_lists,
            vec![
                vec![0, 1],
                vec![0, 1, 2],
                vec![0, 1, 3],
                vec![2, 3],
                vec![0, 1, 2, 3],
            ]
        );

        let single_only = collect(reduction(&ctx(), false, Default::default()));
        assert!(
            single_only
                .iter()
                .all(|s| !matches!(s.kwargs.get("dim"), Some(Value::IntList(_))))
        );
    }

    #[test]
    fn reduction_follows_requested_layout() {
        let ctx = ctx().with_contiguity(Some(Contiguity::NoncontigHoles));
        let samples = collect(reduction(&ctx, false, Default::default()));
        assert!(
            samples
                .iter()
                .all(|s| s.input.as_nested().is_some_and(|nt| nt.has_holes()))
        );
    }

    #[test]
    fn embedding_bag_skips_weighted_non_sum_modes() {
        let samples = collect(super::embedding_bag_samples(&ctx()));
        let combos: Vec<(String, bool)> = samples
            .iter()
            .map(|s| {
                let mode = match s.kwargs.get("mode") {
                    Some(Value::Str(mode)) => mode.clone(),
                    other => panic!("mode missing: {other:?}"),
                };
                let weighted = s.kwargs.get("per_sample_weights").is_some_and(Value::is_nested);
                (mode, weighted)
            })
            .collect();
        assert_eq!(
            combos,
            vec![
                ("sum".to_string(), true),
                ("sum".to_string(), false),
                ("mean".to_string(), false),
                ("max".to_string(), false),
            ]
        );
    }

    #[test]
    fn to_samples_skip_the_source_dtype() {
        let samples = collect(super::to_samples(&ctx()));
        assert_eq!(samples.len(), 6 * 2);
        assert!(
            samples
                .iter()
                .all(|s| !matches!(s.kwargs.get("dtype"), Some(Value::DType(DType::F32))))
        );
        let cuda = SampleContext::new(Device::Cuda, DType::F64, false).with_seed(Some(1));
        let samples = collect(super::to_samples(&cuda));
        assert_eq!(samples.len(), 6 * 3);
    }

    #[test]
    fn matmul_reuses_bmm_samples_as_other() {
        let samples = collect(super::matmul_samples(&ctx()));
        assert_eq!(samples.len(), 2 + 2 + 2);
        assert!(samples.iter().all(|s| s.kwargs.contains_key("other")));
        assert!(samples.iter().all(|s| !s.kwargs.contains_key("mat2")));
    }

    #[test]
    fn unsupported_generator_fails_before_sampling() {
        let op = find_op("softmax").expect("softmax is in the catalog");
        let func = SampleInputsFunc::Unsupported {
            op_name: "softmax".to_string(),
        };
        let err = func.generate(op, &ctx()).err().expect("unsupported");
        assert!(matches!(err, NjtOpInfoError::Unsupported { ref op_name } if op_name == "softmax"));
    }
}
