use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use ft_core::{DType, Device};
use ft_dispatch::{MVLGAMMA_VARIANTS, OpCategory, OpInfo, POLYGAMMA_VARIANTS, Value, op_db};

use crate::NjtOpInfoError;
use crate::generators::{SampleInputsFunc, SampleIter};
use crate::reference::ReferenceFunc;
use crate::sample::{Contiguity, DimType, SampleContext, SampleInput};

/// Dim-argument names per overload; `"..."` marks a multi-dim overload.
pub type DimArgs = &'static [&'static [&'static str]];

/// Whether an entry's annotations came from the table or from defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Annotated,
    Assumed,
}

/// Jagged-testing annotations layered over a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraOpData {
    pub is_view: bool,
    pub dim_args: Option<DimArgs>,
    pub dim_support: Option<BTreeSet<DimType>>,
    pub contiguity_support: BTreeSet<Contiguity>,
    pub provenance: Provenance,
}

impl ExtraOpData {
    /// An annotated entry. Dim-wise ops default to supporting every dim type;
    /// every op defaults to supporting every layout.
    #[must_use]
    pub fn annotated(is_view: bool, dim_args: Option<DimArgs>) -> Self {
        Self {
            is_view,
            dim_args,
            dim_support: dim_args.map(|_| DimType::ALL.into_iter().collect()),
            contiguity_support: Contiguity::ALL.into_iter().collect(),
            provenance: Provenance::Annotated,
        }
    }

    /// Defaults for an op absent from the annotation table.
    #[must_use]
    pub fn assumed() -> Self {
        Self {
            provenance: Provenance::Assumed,
            ..Self::annotated(false, None)
        }
    }

    #[must_use]
    pub fn with_dim_support(mut self, dim_support: impl IntoIterator<Item = DimType>) -> Self {
        self.dim_support = Some(dim_support.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_contiguity_support(
        mut self,
        contiguity_support: impl IntoIterator<Item = Contiguity>,
    ) -> Self {
        self.contiguity_support = contiguity_support.into_iter().collect();
        self
    }

    #[must_use]
    pub fn is_dimwise(&self) -> bool {
        self.dim_args.is_some()
    }
}

impl Default for ExtraOpData {
    fn default() -> Self {
        Self::assumed()
    }
}

const AXIS0: DimArgs = &[&["axis0"]];
const DIM: DimArgs = &[&["dim"]];
const DIM_OR_DIMS: DimArgs = &[&["dim"], &["dim", "..."]];
const DIMS: DimArgs = &[&["dims", "..."]];
const DIM1_DIM2: DimArgs = &[&["dim1", "dim2"]];
const DIM0_DIM1: DimArgs = &[&["dim0", "dim1"]];
const START_END: DimArgs = &[&["start_dim", "end_dim"]];
const DIMENSION: DimArgs = &[&["dimension"]];
const MOVEDIM: DimArgs = &[
    &["source", "destination"],
    &["source", "...", "destination", "..."],
];

/// `(full_name, is_view, dim_args)` for every annotated op.
const ANNOTATIONS: &[(&str, bool, Option<DimArgs>)] = &[
    ("_segment_reduce.lengths", false, Some(AXIS0)),
    ("_segment_reduce.offsets", false, Some(AXIS0)),
    ("all", false, Some(DIM_OR_DIMS)),
    ("any", false, Some(DIM_OR_DIMS)),
    ("argsort", false, Some(DIM)),
    ("broadcast_to", true, None),
    ("cat", false, Some(DIM)),
    ("chunk", true, Some(DIM)),
    ("conj", true, None),
    ("contiguous", true, None),
    ("cummax", false, Some(DIM)),
    ("cummin", false, Some(DIM)),
    ("cumprod", false, Some(DIM)),
    ("cumsum", false, Some(DIM)),
    ("cumulative_trapezoid", false, Some(DIM)),
    ("diag_embed", false, Some(DIM1_DIM2)),
    ("diagonal", true, Some(DIM1_DIM2)),
    ("diagonal_copy", false, Some(DIM1_DIM2)),
    ("diagonal_scatter", false, Some(DIM1_DIM2)),
    ("diff", false, Some(DIM)),
    ("expand", true, None),
    ("expand_as", true, None),
    ("fft.fft", false, Some(DIM)),
    ("fft.hfft", false, Some(DIM)),
    ("fft.ifft", false, Some(DIM)),
    ("fft.ihfft", false, Some(DIM)),
    ("fft.irfft", false, Some(DIM)),
    ("fft.rfft", false, Some(DIM)),
    ("flatten", true, Some(START_END)),
    ("flip", false, Some(DIMS)),
    ("gather", false, Some(DIM)),
    ("imag", true, None),
    ("index_add", false, Some(DIM)),
    ("index_copy", false, Some(DIM)),
    ("index_fill", false, Some(DIM)),
    ("index_reduce.amax", false, Some(DIM)),
    ("index_reduce.amin", false, Some(DIM)),
    ("index_reduce.mean", false, Some(DIM)),
    ("index_reduce.prod", false, Some(DIM)),
    ("index_select", false, Some(DIM)),
    ("kthvalue", false, Some(DIM)),
    ("linalg.cross", false, Some(DIM)),
    ("linalg.diagonal", true, Some(DIM1_DIM2)),
    ("linalg.tensorsolve", false, Some(DIMS)),
    ("linalg.vecdot", false, Some(DIM)),
    ("log_softmax", false, Some(DIM)),
    ("logcumsumexp", false, Some(DIM)),
    ("max.reduction_with_dim", false, Some(DIM)),
    ("median", false, Some(DIM)),
    ("min.reduction_with_dim", false, Some(DIM)),
    ("mode", false, Some(DIM)),
    ("movedim", false, Some(MOVEDIM)),
    ("nanmedian", false, Some(DIM)),
    ("narrow", true, Some(DIM)),
    ("narrow_copy", false, Some(DIM)),
    ("nn.functional.cosine_similarity", false, Some(DIM)),
    ("nn.functional.glu", false, Some(DIM)),
    ("permute", true, Some(DIMS)),
    ("positive", true, None),
    ("prod", false, Some(DIM)),
    ("ravel", true, None),
    ("real", true, None),
    ("renorm", false, Some(DIM)),
    ("reshape", true, None),
    ("reshape_as", true, None),
    ("roll", false, Some(DIMS)),
    ("rot90", false, Some(DIMS)),
    ("scatter", false, Some(DIM)),
    ("scatter_add", false, Some(DIM)),
    ("scatter_reduce.amax", false, Some(DIM)),
    ("scatter_reduce.amin", false, Some(DIM)),
    ("scatter_reduce.mean", false, Some(DIM)),
    ("scatter_reduce.prod", false, Some(DIM)),
    ("scatter_reduce.sum", false, Some(DIM)),
    ("select", true, Some(DIM)),
    ("select_scatter", false, Some(DIM)),
    ("slice", true, Some(DIM)),
    ("slice_scatter", false, Some(DIM)),
    ("softmax", false, Some(DIM)),
    ("sort", false, Some(DIM)),
    ("split", true, Some(DIM)),
    ("split_with_sizes", true, Some(DIM)),
    ("split_with_sizes_copy", false, Some(DIM)),
    ("squeeze", true, Some(DIM_OR_DIMS)),
    ("squeeze_copy", false, Some(DIM_OR_DIMS)),
    ("stack", false, Some(DIM)),
    ("t", true, None),
    ("tensor_split", true, Some(DIM)),
    ("tensordot", false, Some(DIMS)),
    ("tile", false, Some(DIMS)),
    ("topk", false, Some(DIM)),
    ("transpose", true, Some(DIM0_DIM1)),
    ("transpose_copy", false, Some(DIM0_DIM1)),
    ("trapezoid", false, Some(DIM)),
    ("trapz", false, Some(DIM)),
    ("unbind", true, Some(DIM)),
    ("unflatten", true, Some(DIM)),
    ("unfold", true, Some(DIMENSION)),
    ("unfold_copy", false, Some(DIMENSION)),
    ("unsafe_chunk", false, Some(DIM)),
    ("unsafe_split", false, Some(DIM)),
    ("unsqueeze", true, Some(DIM)),
    ("unsqueeze_copy", false, Some(DIM)),
    ("view", true, None),
    ("view_as", true, None),
    ("view_as_complex", true, None),
    ("view_as_real", true, None),
];

fn annotation_table() -> &'static BTreeMap<&'static str, ExtraOpData> {
    static TABLE: OnceLock<BTreeMap<&'static str, ExtraOpData>> = OnceLock::new();
    TABLE.get_or_init(|| {
        ANNOTATIONS
            .iter()
            .map(|&(name, is_view, dim_args)| (name, ExtraOpData::annotated(is_view, dim_args)))
            .collect()
    })
}

/// Annotations for `full_name`, or the assumed defaults.
#[must_use]
pub fn extra_op_data(full_name: &str) -> ExtraOpData {
    annotation_table()
        .get(full_name)
        .cloned()
        .unwrap_or_default()
}

/// Op-specific generators, consulted before the category defaults.
pub fn njt_sample_inputs() -> &'static BTreeMap<String, SampleInputsFunc> {
    static TABLE: OnceLock<BTreeMap<String, SampleInputsFunc>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = BTreeMap::new();
        for name in [
            "argmax",
            "argmin",
            "max.reduction_with_dim",
            "min.reduction_with_dim",
            "prod",
        ] {
            table.insert(name.to_string(), SampleInputsFunc::reduction(false));
        }
        for (name, func) in [
            ("bmm", SampleInputsFunc::Bmm),
            ("clone", SampleInputsFunc::Clone),
            ("nn.functional.embedding", SampleInputsFunc::Embedding),
            ("nn.functional.embedding_bag", SampleInputsFunc::EmbeddingBag),
            ("nn.functional.linear", SampleInputsFunc::Linear),
            ("nn.functional.rms_norm", SampleInputsFunc::RmsNorm),
            ("to", SampleInputsFunc::To),
            ("matmul", SampleInputsFunc::Matmul),
            ("masked_select", SampleInputsFunc::MaskedSelect),
            ("index_put", SampleInputsFunc::IndexPut),
        ] {
            table.insert(name.to_string(), func);
        }
        table.insert(
            "nn.functional.threshold".to_string(),
            SampleInputsFunc::unary_with(&[
                ("threshold", Value::Float(0.153_320_312_5)),
                ("value", Value::Int(-9)),
            ]),
        );
        for (variant, p) in MVLGAMMA_VARIANTS {
            table.insert(
                format!("mvlgamma.{variant}"),
                SampleInputsFunc::unary_with(&[("p", Value::Int(i64::from(p)))]),
            );
        }
        for (variant, n) in POLYGAMMA_VARIANTS {
            table.insert(
                format!("polygamma.{variant}"),
                SampleInputsFunc::unary_with(&[("n", Value::Int(i64::from(n)))]),
            );
        }
        table.insert(
            "special.polygamma.special_polygamma_n_0".to_string(),
            SampleInputsFunc::unary_with(&[("n", Value::Int(0))]),
        );
        table
    })
}

/// Op-specific references; ops with an override generator but no entry here
/// use the per-item decomposition.
pub fn njt_references() -> &'static BTreeMap<String, ReferenceFunc> {
    static TABLE: OnceLock<BTreeMap<String, ReferenceFunc>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = BTreeMap::new();
        for name in [
            "argmax",
            "argmin",
            "max.reduction_with_dim",
            "min.reduction_with_dim",
            "prod",
        ] {
            table.insert(name.to_string(), ReferenceFunc::Reduction);
        }
        table.insert("bmm".to_string(), ReferenceFunc::Bmm);
        table.insert(
            "nn.functional.embedding_bag".to_string(),
            ReferenceFunc::EmbeddingBag,
        );
        table
    })
}

/// A catalog entry augmented for jagged-batch testing.
#[derive(Debug, Clone)]
pub struct NjtOpInfo {
    pub op: OpInfo,
    pub supports_njt: bool,
    pub extra_op_data: ExtraOpData,
    pub sample_inputs_func: SampleInputsFunc,
    pub reference: ReferenceFunc,
}

impl NjtOpInfo {
    #[must_use]
    pub fn full_name(&self) -> String {
        self.op.full_name()
    }

    pub fn sample_inputs(&self, ctx: &SampleContext) -> Result<SampleIter, NjtOpInfoError> {
        self.sample_inputs_func.generate(&self.op, ctx)
    }

    pub fn reference_output(&self, sample: &SampleInput) -> Result<Value, NjtOpInfoError> {
        self.reference.compute(&self.op, sample)
    }
}

/// Attaches jagged generators, references and annotations to a catalog entry.
///
/// The override tables win; otherwise the entry's category picks the
/// generator and reference. Unclassified entries without an override are
/// marked unsupported.
#[must_use]
pub fn translate_opinfo(op: &OpInfo) -> NjtOpInfo {
    let full_name = op.full_name();
    let extra_op_data = extra_op_data(&full_name);

    let (supports_njt, sample_inputs_func, reference) =
        if let Some(func) = njt_sample_inputs().get(&full_name) {
            let reference = njt_references()
                .get(&full_name)
                .cloned()
                .unwrap_or(ReferenceFunc::Unbind);
            (true, func.clone(), reference)
        } else {
            match op.category {
                OpCategory::UnaryElementwise => {
                    (true, SampleInputsFunc::elementwise_unary(), ReferenceFunc::Unbind)
                }
                OpCategory::BinaryElementwise => {
                    (true, SampleInputsFunc::elementwise_binary(), ReferenceFunc::Unbind)
                }
                OpCategory::Reduction => {
                    (true, SampleInputsFunc::reduction(true), ReferenceFunc::Reduction)
                }
                OpCategory::Unclassified => (
                    false,
                    SampleInputsFunc::Unsupported {
                        op_name: full_name.clone(),
                    },
                    ReferenceFunc::Unsupported {
                        op_name: full_name.clone(),
                    },
                ),
            }
        };

    NjtOpInfo {
        op: op.clone(),
        supports_njt,
        extra_op_data,
        sample_inputs_func,
        reference,
    }
}

/// Every catalog entry translated, keyed by full name.
pub fn njt_op_db() -> &'static BTreeMap<String, NjtOpInfo> {
    static DB: OnceLock<BTreeMap<String, NjtOpInfo>> = OnceLock::new();
    DB.get_or_init(|| {
        op_db()
            .iter()
            .map(|op| (op.full_name(), translate_opinfo(op)))
            .collect()
    })
}

#[must_use]
pub fn find_njt_op(full_name: &str) -> Option<&'static NjtOpInfo> {
    njt_op_db().get(full_name)
}

/// Parameters of one generated test.
#[derive(Debug, Clone, Copy)]
pub struct TestParams<'a> {
    pub op: &'a NjtOpInfo,
    pub device: Device,
    pub dtype: DType,
    pub dim_type: Option<DimType>,
    pub contiguity: Option<Contiguity>,
}

impl<'a> TestParams<'a> {
    #[must_use]
    pub const fn new(op: &'a NjtOpInfo, device: Device, dtype: DType) -> Self {
        Self {
            op,
            device,
            dtype,
            dim_type: None,
            contiguity: None,
        }
    }

    #[must_use]
    pub fn sample_context(&self, requires_grad: bool, seed: Option<u64>) -> SampleContext {
        SampleContext::new(self.device, self.dtype, requires_grad)
            .with_seed(seed)
            .with_dim_type(self.dim_type)
            .with_contiguity(self.contiguity)
    }
}

/// Expands one test into a variant per supported layout and, for dim-wise
/// ops, per supported dim type.
///
/// Variant names append `_{dim_type}` when a dim type applies, then
/// `_{contiguity}`.
#[must_use]
pub fn include_dim_type_and_contiguity<'a>(
    test_name: &str,
    params: &TestParams<'a>,
) -> Vec<(String, TestParams<'a>)> {
    let extra = &params.op.extra_op_data;
    let dim_types: Vec<Option<DimType>> = match &extra.dim_support {
        Some(support) => support.iter().copied().map(Some).collect(),
        None => vec![None],
    };

    let mut variants = Vec::with_capacity(extra.contiguity_support.len() * dim_types.len());
    for &contiguity in &extra.contiguity_support {
        for &dim_type in &dim_types {
            let mut name = test_name.to_string();
            if let Some(dim_type) = dim_type {
                name.push('_');
                name.push_str(dim_type.as_str());
            }
            name.push('_');
            name.push_str(contiguity.as_str());
            variants.push((
                name,
                TestParams {
                    dim_type,
                    contiguity: Some(contiguity),
                    ..*params
                },
            ));
        }
    }
    variants
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ft_core::{DType, Device};
    use ft_dispatch::{OpCategory, op_db};

    use super::{
        ExtraOpData, Provenance, TestParams, extra_op_data, find_njt_op,
        include_dim_type_and_contiguity, njt_op_db, njt_sample_inputs,
    };
    use crate::NjtOpInfoError;
    use crate::generators::SampleInputsFunc;
    use crate::reference::ReferenceFunc;
    use crate::sample::{Contiguity, DimType, SampleContext};

    #[test]
    fn annotated_dimwise_ops_default_to_every_dim_type() {
        let transpose = extra_op_data("transpose");
        assert!(transpose.is_view);
        assert_eq!(transpose.provenance, Provenance::Annotated);
        assert_eq!(transpose.dim_args, Some(&[&["dim0", "dim1"][..]][..]));
        assert_eq!(
            transpose.dim_support,
            Some(DimType::ALL.into_iter().collect::<BTreeSet<_>>())
        );
        assert_eq!(transpose.contiguity_support.len(), 3);

        let movedim = extra_op_data("movedim");
        assert_eq!(movedim.dim_args.map(<[_]>::len), Some(2));
        assert!(!movedim.is_view);

        let view = extra_op_data("view");
        assert!(view.is_view);
        assert!(view.dim_support.is_none());
    }

    #[test]
    fn unannotated_ops_are_assumed() {
        let sum = extra_op_data("sum");
        assert_eq!(sum, ExtraOpData::assumed());
        assert_eq!(sum.provenance, Provenance::Assumed);
        assert!(!sum.is_view);
        assert!(sum.dim_args.is_none() && sum.dim_support.is_none());
        assert_eq!(sum.contiguity_support.len(), 3);
    }

    #[test]
    fn translation_follows_category_then_overrides() {
        let abs = find_njt_op("abs").expect("abs");
        assert!(abs.supports_njt);
        assert!(matches!(abs.sample_inputs_func, SampleInputsFunc::ElementwiseUnary { .. }));
        assert_eq!(abs.reference, ReferenceFunc::Unbind);

        let add = find_njt_op("add").expect("add");
        assert!(matches!(add.sample_inputs_func, SampleInputsFunc::ElementwiseBinary { .. }));

        let sum = find_njt_op("sum").expect("sum");
        assert!(matches!(
            sum.sample_inputs_func,
            SampleInputsFunc::Reduction {
                supports_dimlist: true,
                ..
            }
        ));
        assert_eq!(sum.reference, ReferenceFunc::Reduction);

        let prod = find_njt_op("prod").expect("prod");
        assert!(matches!(
            prod.sample_inputs_func,
            SampleInputsFunc::Reduction {
                supports_dimlist: false,
                ..
            }
        ));
        assert_eq!(prod.reference, ReferenceFunc::Reduction);

        let bmm = find_njt_op("bmm").expect("bmm");
        assert_eq!(bmm.reference, ReferenceFunc::Bmm);

        let clone = find_njt_op("clone").expect("clone");
        assert_eq!(clone.reference, ReferenceFunc::Unbind);

        let mvlgamma = find_njt_op("mvlgamma.mvlgamma_p_3").expect("mvlgamma");
        let SampleInputsFunc::ElementwiseUnary { op_kwargs } = &mvlgamma.sample_inputs_func else {
            panic!("mvlgamma uses the unary generator");
        };
        assert!(matches!(op_kwargs.get("p"), Some(ft_dispatch::Value::Int(3))));
    }

    #[test]
    fn unclassified_ops_without_overrides_are_unsupported() {
        let softmax = find_njt_op("softmax").expect("softmax");
        assert!(!softmax.supports_njt);
        let ctx = SampleContext::new(Device::Cpu, DType::F32, false);
        let err = softmax.sample_inputs(&ctx).err().expect("unsupported");
        assert_eq!(
            err,
            NjtOpInfoError::Unsupported {
                op_name: "softmax".to_string()
            }
        );
        assert!(err.to_string().contains("softmax"));
        // annotations survive even for unsupported ops
        assert!(softmax.extra_op_data.is_dimwise());
    }

    #[test]
    fn every_catalog_entry_is_translated() {
        assert_eq!(njt_op_db().len(), op_db().len());
        for op in op_db() {
            let translated = find_njt_op(&op.full_name()).expect("translated");
            let overridden = njt_sample_inputs().contains_key(&op.full_name());
            let expected = overridden || op.category != OpCategory::Unclassified;
            assert_eq!(translated.supports_njt, expected, "{}", op.full_name());
        }
    }

    #[test]
    fn expansion_covers_layouts_and_dim_types() {
        let op = find_njt_op("max.reduction_with_dim").expect("max");
        let params = TestParams::new(op, Device::Cpu, DType::F32);
        let variants = include_dim_type_and_contiguity("test_forward", &params);
        assert_eq!(variants.len(), 9);
        let names: BTreeSet<&str> = variants.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names.len(), 9);
        assert!(names.contains("test_forward_batch_dim_contig"));
        assert!(names.contains("test_forward_ragged_dim_noncontig_holes"));
        assert!(names.contains("test_forward_normal_dim_noncontig_transposed"));
        for (name, variant) in &variants {
            let contiguity = variant.contiguity.expect("contiguity set");
            assert!(name.ends_with(contiguity.as_str()));
            assert!(variant.dim_type.is_some());
        }
    }

    #[test]
    fn expansion_without_dim_args_only_varies_layout() {
        let op = find_njt_op("abs").expect("abs");
        let params = TestParams::new(op, Device::Cpu, DType::F32);
        let names: Vec<String> = include_dim_type_and_contiguity("test_forward", &params)
            .into_iter()
            .map(|(name, variant)| {
                assert!(variant.dim_type.is_none());
                name
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "test_forward_contig".to_string(),
                "test_forward_noncontig_transposed".to_string(),
                "test_forward_noncontig_holes".to_string(),
            ]
        );
    }

    #[test]
    fn narrowed_support_shrinks_expansion() {
        let mut op = find_njt_op("transpose").expect("transpose").clone();
        op.extra_op_data = op
            .extra_op_data
            .clone()
            .with_dim_support([DimType::NormalDim])
            .with_contiguity_support([Contiguity::Contig]);
        let params = TestParams::new(&op, Device::Cpu, DType::F64);
        let variants = include_dim_type_and_contiguity("test_view", &params);
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].0, "test_view_normal_dim_contig");
        assert_eq!(variants[0].1.dtype, DType::F64);
    }
}
