use std::collections::VecDeque;
use std::fmt;

use ft_core::{DType, DenseTensor, Device, seedable_rng};
use ft_dispatch::{Kwargs, Value};
use ft_nested::JaggedTensor;
use rand::Rng;
use rand::rngs::StdRng;

use crate::NjtOpInfoError;

/// Storage layout variant exercised by a sample batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Contiguity {
    Contig,
    NoncontigTransposed,
    NoncontigHoles,
}

impl Contiguity {
    pub const ALL: [Self; 3] = [
        Self::Contig,
        Self::NoncontigTransposed,
        Self::NoncontigHoles,
    ];

    /// Layout of an existing batch: holes first, then any strided values.
    #[must_use]
    pub fn of(nt: &JaggedTensor) -> Self {
        if nt.has_holes() {
            Self::NoncontigHoles
        } else if nt.values().is_contiguous() {
            Self::Contig
        } else {
            Self::NoncontigTransposed
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Contig => "contig",
            Self::NoncontigTransposed => "noncontig_transposed",
            Self::NoncontigHoles => "noncontig_holes",
        }
    }
}

impl fmt::Display for Contiguity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which axis of a jagged batch a dim-taking op targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DimType {
    BatchDim,
    RaggedDim,
    NormalDim,
}

impl DimType {
    pub const ALL: [Self; 3] = [Self::BatchDim, Self::RaggedDim, Self::NormalDim];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BatchDim => "batch_dim",
            Self::RaggedDim => "ragged_dim",
            Self::NormalDim => "normal_dim",
        }
    }
}

impl fmt::Display for DimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One op invocation: primary input, positional args, keyword args.
#[derive(Debug, Clone)]
pub struct SampleInput {
    pub input: Value,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub name: Option<String>,
}

impl SampleInput {
    #[must_use]
    pub fn new(input: impl Into<Value>) -> Self {
        Self {
            input: input.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            name: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    #[must_use]
    pub fn with_kwarg(mut self, name: &str, value: Value) -> Self {
        self.kwargs.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The input, falling back to the first positional arg, as a jagged tensor.
    #[must_use]
    pub fn driving_nested(&self) -> Option<&JaggedTensor> {
        self.input
            .as_nested()
            .or_else(|| self.args.iter().find_map(Value::as_nested))
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

/// Device, dtype and grad flag shared by every tensor a generator creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleContext {
    pub device: Device,
    pub dtype: DType,
    pub requires_grad: bool,
    pub dim_type: Option<DimType>,
    pub contiguity: Option<Contiguity>,
    pub seed: Option<u64>,
}

impl SampleContext {
    #[must_use]
    pub const fn new(device: Device, dtype: DType, requires_grad: bool) -> Self {
        Self {
            device,
            dtype,
            requires_grad,
            dim_type: None,
            contiguity: None,
            seed: None,
        }
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub const fn with_contiguity(mut self, contiguity: Option<Contiguity>) -> Self {
        self.contiguity = contiguity;
        self
    }

    #[must_use]
    pub const fn with_dim_type(mut self, dim_type: Option<DimType>) -> Self {
        self.dim_type = dim_type;
        self
    }

    /// Independent stream per generator stage; unseeded contexts draw from entropy.
    #[must_use]
    pub fn rng(&self, stream: u64) -> StdRng {
        seedable_rng(
            self.seed
                .map(|seed| seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        )
    }

    #[must_use]
    pub fn randn(&self, shape: Vec<usize>, rng: &mut impl Rng) -> DenseTensor {
        DenseTensor::randn(shape, self.dtype, self.device, rng)
    }

    /// Like [`Self::randn`], carrying the context's grad flag.
    #[must_use]
    pub fn randn_param(&self, shape: Vec<usize>, rng: &mut impl Rng) -> DenseTensor {
        self.randn(shape, rng).with_requires_grad(self.requires_grad)
    }
}

/// Random extent for an unspecified dim.
pub fn rnd_size(rng: &mut impl Rng) -> usize {
    rng.gen_range(3..8)
}

/// Builds a batch from a shape template; `None` entries vary per item.
///
/// Entry 0 is the batch size and must be fixed. The first `None` entry
/// becomes the ragged dim.
pub fn random_nt_from_dims(
    dims: &[Option<usize>],
    ctx: &SampleContext,
    rng: &mut impl Rng,
) -> Result<JaggedTensor, NjtOpInfoError> {
    let Some((batch, inner)) = dims.split_first() else {
        return Err(NjtOpInfoError::StructuralMismatch {
            detail: "shape template needs a batch dim".to_string(),
        });
    };
    let batch = batch.ok_or_else(|| NjtOpInfoError::StructuralMismatch {
        detail: "batch dim of a shape template must be fixed".to_string(),
    })?;
    let inner_ragged = inner.iter().position(Option::is_none).unwrap_or(0);

    let components: Vec<DenseTensor> = (0..batch)
        .map(|_| {
            let shape = inner
                .iter()
                .map(|extent| extent.unwrap_or_else(|| rnd_size(rng)))
                .collect();
            ctx.randn(shape, rng)
        })
        .collect();
    let nt = JaggedTensor::from_components_along(&components, inner_ragged)?;
    Ok(nt.with_requires_grad(ctx.requires_grad))
}

/// Lazily yields sample batches of each requested rank in one layout.
///
/// * `Contig` yields a freshly packed batch and a detached batch rebuilt from
///   its values and offsets.
/// * `NoncontigTransposed` yields the last two dims swapped, for rank > 2 only.
/// * `NoncontigHoles` yields a batch whose lengths are one shorter than the
///   offset spans.
pub struct NjtSampler {
    ctx: SampleContext,
    contiguity: Contiguity,
    ranks: std::vec::IntoIter<usize>,
    pending: VecDeque<JaggedTensor>,
    rng: StdRng,
}

impl NjtSampler {
    #[must_use]
    pub fn new(ctx: SampleContext, ranks: Vec<usize>, contiguity: Contiguity, rng: StdRng) -> Self {
        Self {
            ctx,
            contiguity,
            ranks: ranks.into_iter(),
            pending: VecDeque::new(),
            rng,
        }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    fn batches_for_rank(&mut self, rank: usize) -> Result<Vec<JaggedTensor>, NjtOpInfoError> {
        if rank < 2 {
            return Err(NjtOpInfoError::StructuralMismatch {
                detail: format!("sample batches need rank >= 2, got {rank}"),
            });
        }
        let mut template = vec![Some(rnd_size(&mut self.rng)), None];
        for _ in 2..rank {
            template.push(Some(rnd_size(&mut self.rng)));
        }
        let nt = random_nt_from_dims(&template, &self.ctx, &mut self.rng)?;

        match self.contiguity {
            Contiguity::Contig => {
                let values = nt.values().contiguous_copy().with_requires_grad(false);
                let rebuilt = JaggedTensor::from_jagged(values, nt.offsets().to_vec(), None)?;
                Ok(vec![nt, rebuilt])
            }
            Contiguity::NoncontigTransposed => {
                if rank > 2 {
                    Ok(vec![nt.transpose(-2, -1)?])
                } else {
                    Ok(Vec::new())
                }
            }
            Contiguity::NoncontigHoles => {
                let lengths = nt
                    .offsets()
                    .windows(2)
                    .map(|pair| pair[1] - pair[0] - 1)
                    .collect();
                let values = nt.values().contiguous_copy().with_requires_grad(false);
                let holed =
                    JaggedTensor::from_jagged(values, nt.offsets().to_vec(), Some(lengths))?;
                Ok(vec![holed])
            }
        }
    }
}

impl Iterator for NjtSampler {
    type Item = Result<JaggedTensor, NjtOpInfoError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(nt) = self.pending.pop_front() {
                return Some(Ok(nt));
            }
            let rank = self.ranks.next()?;
            match self.batches_for_rank(rank) {
                Ok(batches) => self.pending.extend(batches),
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

/// Default sample batches: ranks 2, 3 and 4.
#[must_use]
pub fn sample_njts(ctx: &SampleContext, contiguity: Contiguity, rng: StdRng) -> NjtSampler {
    NjtSampler::new(*ctx, vec![2, 3, 4], contiguity, rng)
}

pub type SampleResult = Result<SampleInput, NjtOpInfoError>;

/// Expands each batch from a sampler into zero or more samples.
///
/// Samples for one batch are built together; batches are drawn on demand.
pub struct PerBatch<F> {
    sampler: NjtSampler,
    pending: VecDeque<SampleResult>,
    expand: F,
}

impl<F> PerBatch<F>
where
    F: FnMut(JaggedTensor, &mut StdRng) -> Vec<SampleResult>,
{
    pub fn new(sampler: NjtSampler, expand: F) -> Self {
        Self {
            sampler,
            pending: VecDeque::new(),
            expand,
        }
    }
}

impl<F> Iterator for PerBatch<F>
where
    F: FnMut(JaggedTensor, &mut StdRng) -> Vec<SampleResult>,
{
    type Item = SampleResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.pending.pop_front() {
                return Some(sample);
            }
            match self.sampler.next()? {
                Ok(nt) => {
                    let samples = (self.expand)(nt, self.sampler.rng_mut());
                    self.pending.extend(samples);
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, Device};

    use super::{Contiguity, SampleContext, random_nt_from_dims, sample_njts};

    fn ctx() -> SampleContext {
        SampleContext::new(Device::Cpu, DType::F32, false).with_seed(Some(11))
    }

    #[test]
    fn contig_batches_come_in_packed_and_rebuilt_pairs() {
        let ctx = ctx();
        let batches: Vec<_> = sample_njts(&ctx, Contiguity::Contig, ctx.rng(0))
            .collect::<Result<_, _>>()
            .expect("contig batches should build");
        assert_eq!(batches.len(), 6);
        for pair in batches.chunks(2) {
            assert_eq!(pair[0].offsets(), pair[1].offsets());
            assert_ne!(pair[0].ragged_id(), pair[1].ragged_id());
            assert!(pair[0].is_contiguous() && pair[1].is_contiguous());
            assert!(!pair[0].has_holes() && !pair[1].has_holes());
            assert!(pair[0].min_seqlen().is_some());
            assert!(pair[1].min_seqlen().is_none());
        }
        let ranks: Vec<usize> = batches.iter().map(|nt| nt.rank()).collect();
        assert_eq!(ranks, vec![2, 2, 3, 3, 4, 4]);
    }

    #[test]
    fn transposed_batches_skip_rank_two() {
        let ctx = ctx();
        let batches: Vec<_> = sample_njts(&ctx, Contiguity::NoncontigTransposed, ctx.rng(0))
            .collect::<Result<_, _>>()
            .expect("transposed batches should build");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].rank(), 3);
        assert_eq!(batches[0].ragged_idx(), 2);
        assert!(!batches[0].is_contiguous());
        assert_eq!(batches[1].rank(), 4);
        assert_eq!(batches[1].ragged_idx(), 1);
    }

    #[test]
    fn holed_batches_are_one_shorter_per_item() {
        let ctx = ctx();
        for nt in sample_njts(&ctx, Contiguity::NoncontigHoles, ctx.rng(0)) {
            let nt = nt.expect("holed batch should build");
            assert!(nt.has_holes());
            let spans: Vec<usize> = nt.offsets().windows(2).map(|p| p[1] - p[0]).collect();
            let lengths = nt.lengths().expect("holed batch carries lengths");
            for (span, len) in spans.iter().zip(lengths) {
                assert_eq!(span - 1, *len);
            }
        }
    }

    #[test]
    fn template_extents_are_honored() {
        let ctx = ctx();
        let mut rng = ctx.rng(3);
        let nt = random_nt_from_dims(&[Some(4), None, Some(16)], &ctx, &mut rng)
            .expect("template should build");
        assert_eq!(nt.batch_size(), 4);
        assert_eq!(nt.size(2), Some(16));
        assert_eq!(nt.ragged_idx(), 1);
        for len in nt.item_lengths() {
            assert!((3..8).contains(&len));
        }
    }

    #[test]
    fn unfixed_batch_dim_is_rejected() {
        let ctx = ctx();
        let mut rng = ctx.rng(0);
        assert!(random_nt_from_dims(&[None, Some(3)], &ctx, &mut rng).is_err());
    }

    #[test]
    fn seeded_contexts_reproduce_batches() {
        let ctx = ctx();
        let a: Vec<_> = sample_njts(&ctx, Contiguity::Contig, ctx.rng(0))
            .map(|nt| nt.expect("batch").values().to_vec())
            .collect();
        let b: Vec<_> = sample_njts(&ctx, Contiguity::Contig, ctx.rng(0))
            .map(|nt| nt.expect("batch").values().to_vec())
            .collect();
        assert_eq!(a, b);
    }
}
