#![forbid(unsafe_code)]

mod generators;
mod logging;
mod reference;
mod registry;
mod sample;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ft_core::{DType, Device, TensorMetaError};
use ft_dispatch::{DispatchError, Value};
use ft_kernel_cpu::KernelError;
use ft_nested::NestedError;
use serde_json::json;

pub use generators::{SampleInputsFunc, SampleIter};
pub use logging::{LOG_SCHEMA_VERSION, StructuredCaseLog, mode_label};
pub use reference::{
    ReferenceFunc, index_put_item_indices, reduction_reference, reference_bmm,
    reference_embedding_bag, unbind_components, unbind_reference,
};
pub use registry::{
    DimArgs, ExtraOpData, NjtOpInfo, Provenance, TestParams, extra_op_data, find_njt_op,
    include_dim_type_and_contiguity, njt_op_db, njt_references, njt_sample_inputs,
    translate_opinfo,
};
pub use sample::{
    Contiguity, DimType, NjtSampler, SampleContext, SampleInput, SampleResult,
    random_nt_from_dims, rnd_size, sample_njts,
};

pub const SEED_ENV: &str = "FT_NJT_SEED";
const SUITE_ID: &str = "njt_reference_matrix";

#[derive(Debug, Clone, PartialEq)]
pub enum NjtOpInfoError {
    /// No jagged generator or reference is registered for the op.
    Unsupported { op_name: String },
    /// The requested parameters or sample fall outside what the reference covers.
    InvalidCombination { detail: String },
    /// A sample or per-item output does not have the shape of data expected.
    StructuralMismatch { detail: String },
    Nested(NestedError),
    Dispatch(DispatchError),
    Kernel(KernelError),
}

impl NjtOpInfoError {
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::Unsupported { .. } => "unsupported",
            Self::InvalidCombination { .. } => "invalid_combination",
            Self::StructuralMismatch { .. } => "structural_mismatch",
            Self::Nested(_) => "nested_error",
            Self::Dispatch(_) => "dispatch_error",
            Self::Kernel(_) => "kernel_error",
        }
    }
}

impl fmt::Display for NjtOpInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { op_name } => write!(
                f,
                "{op_name} has no jagged sample inputs or reference; register them in the jagged op tables to add support"
            ),
            Self::InvalidCombination { detail } => write!(f, "unsupported combination: {detail}"),
            Self::StructuralMismatch { detail } => write!(f, "structural mismatch: {detail}"),
            Self::Nested(error) => write!(f, "jagged tensor failure: {error}"),
            Self::Dispatch(error) => write!(f, "per-item dispatch failure: {error}"),
            Self::Kernel(error) => write!(f, "kernel failure: {error}"),
        }
    }
}

impl std::error::Error for NjtOpInfoError {}

impl From<NestedError> for NjtOpInfoError {
    fn from(value: NestedError) -> Self {
        Self::Nested(value)
    }
}

impl From<DispatchError> for NjtOpInfoError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<KernelError> for NjtOpInfoError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<TensorMetaError> for NjtOpInfoError {
    fn from(value: TensorMetaError) -> Self {
        Self::Kernel(KernelError::Meta(value))
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub device: Device,
    pub dtype: DType,
    pub requires_grad: bool,
    pub seed: Option<u64>,
    pub op_filter: Option<String>,
    pub contiguity_filter: Option<Contiguity>,
    pub log_path: Option<PathBuf>,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            requires_grad: false,
            seed: seed_from_env(),
            op_filter: None,
            contiguity_filter: None,
            log_path: Some(
                PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                    .join("../../artifacts/njt/reference_matrix.jsonl"),
            ),
        }
    }

    #[must_use]
    pub fn sample_context(&self) -> SampleContext {
        SampleContext::new(self.device, self.dtype, self.requires_grad).with_seed(self.seed)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn seed_from_env() -> Option<u64> {
    std::env::var(SEED_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub ops_total: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
    pub cases_skipped: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn cases_failed(&self) -> usize {
        self.cases_total - self.cases_passed - self.cases_skipped
    }
}

/// Shape summary of a reference output, recorded in case logs.
fn describe_output(value: &Value) -> serde_json::Value {
    match value {
        Value::Nested(nt) => json!({
            "kind": "nested",
            "batch": nt.batch_size(),
            "rank": nt.rank(),
            "ragged_idx": nt.ragged_idx(),
            "dtype": nt.dtype().as_str(),
        }),
        Value::Tensor(arg) => json!({
            "kind": "tensor",
            "shape": arg.tensor.shape(),
            "dtype": arg.tensor.dtype().as_str(),
        }),
        Value::Tuple(items) | Value::List(items) => json!({
            "kind": value.kind(),
            "items": items.iter().map(describe_output).collect::<Vec<_>>(),
        }),
        other => json!({ "kind": other.kind() }),
    }
}

fn nested_batches(value: &Value, out: &mut Vec<usize>) {
    match value {
        Value::Nested(nt) => out.push(nt.batch_size()),
        Value::Tuple(items) | Value::List(items) => {
            for item in items {
                nested_batches(item, out);
            }
        }
        _ => {}
    }
}

/// Per-item references must keep one output item per input item.
fn check_batch_preserved(sample: &SampleInput, output: &Value) -> Result<(), NjtOpInfoError> {
    let Some(driving) = sample.driving_nested() else {
        return Ok(());
    };
    let mut batches = Vec::new();
    nested_batches(output, &mut batches);
    match batches.into_iter().find(|&batch| batch != driving.batch_size()) {
        Some(found) => Err(NjtOpInfoError::StructuralMismatch {
            detail: format!(
                "reference output has batch {found} but input has batch {}",
                driving.batch_size()
            ),
        }),
        None => Ok(()),
    }
}

fn outcome_for(result: &Result<Value, NjtOpInfoError>) -> (&'static str, &'static str) {
    match result {
        Ok(_) => ("pass", "reference_computed"),
        Err(error @ NjtOpInfoError::InvalidCombination { .. }) => ("skip", error.reason_code()),
        Err(error) => ("fail", error.reason_code()),
    }
}

#[allow(clippy::too_many_arguments)]
fn case_log(
    config: &HarnessConfig,
    op: &NjtOpInfo,
    requested: Contiguity,
    layout: Contiguity,
    case_name: &str,
    result: &Result<Value, NjtOpInfoError>,
    started: Instant,
) -> StructuredCaseLog {
    let (outcome, reason_code) = outcome_for(result);
    let full_name = op.full_name();
    let mut extra = BTreeMap::new();
    extra.insert("dtype".to_string(), json!(config.dtype.as_str()));
    extra.insert("device".to_string(), json!(config.device.as_str()));
    extra.insert("reference".to_string(), json!(format!("{:?}", op.reference)));
    extra.insert("requested_layout".to_string(), json!(mode_label(requested)));
    match result {
        Ok(output) => {
            extra.insert("output".to_string(), describe_output(output));
        }
        Err(error) => {
            extra.insert("error".to_string(), json!(error.to_string()));
        }
    }
    let seed_arg = config
        .seed
        .map_or_else(String::new, |seed| format!(" --seed {seed}"));
    StructuredCaseLog::new(
        SUITE_ID,
        &full_name,
        &format!("{requested}/{case_name}"),
        layout,
        config.seed,
        vec![format!("crates/ft-conformance/src/registry.rs#{full_name}")],
        format!(
            "cargo run -p ft-conformance --bin run_njt_matrix -- --op {full_name} --contiguity {}{seed_arg}",
            mode_label(requested)
        ),
        outcome,
        reason_code,
    )
    .with_duration_ms(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX))
    .with_extra_fields(extra)
}

/// Computes the reference for every sample of every supported op, once per
/// layout the op supports.
pub fn run_reference_matrix(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<StructuredCaseLog>), String> {
    let ops: Vec<&NjtOpInfo> = njt_op_db()
        .values()
        .filter(|op| op.supports_njt)
        .filter(|op| {
            config
                .op_filter
                .as_deref()
                .is_none_or(|filter| filter == op.full_name())
        })
        .collect();

    let mut logs = Vec::new();
    for op in &ops {
        for &contiguity in &op.extra_op_data.contiguity_support {
            if config.contiguity_filter.is_some_and(|only| only != contiguity) {
                continue;
            }
            let ctx = config.sample_context().with_contiguity(Some(contiguity));
            let started = Instant::now();
            let samples = match op.sample_inputs(&ctx) {
                Ok(samples) => samples,
                Err(error) => {
                    let result = Err(error);
                    logs.push(case_log(
                        config, op, contiguity, contiguity, "generator", &result, started,
                    ));
                    continue;
                }
            };
            for (index, sample) in samples.enumerate() {
                let started = Instant::now();
                let (layout, case_name, result) = match sample {
                    Ok(sample) => {
                        let layout = sample.driving_nested().map_or(contiguity, Contiguity::of);
                        let result = op.reference_output(&sample).and_then(|output| {
                            check_batch_preserved(&sample, &output).map(|()| output)
                        });
                        (layout, format!("{index:03} {}", sample.label()), result)
                    }
                    Err(error) => (contiguity, format!("{index:03} generation"), Err(error)),
                };
                logs.push(case_log(
                    config, op, contiguity, layout, &case_name, &result, started,
                ));
            }
        }
    }

    if let Some(path) = &config.log_path {
        write_case_logs(path, &logs)?;
    }

    let cases_passed = logs.iter().filter(|log| log.passed()).count();
    let cases_skipped = logs.iter().filter(|log| log.outcome == "skip").count();
    let report = HarnessReport {
        suite: SUITE_ID,
        ops_total: ops.len(),
        cases_total: logs.len(),
        cases_passed,
        cases_skipped,
    };
    Ok((report, logs))
}

/// Writes one JSON object per line, creating parent directories.
pub fn write_case_logs(output_path: &Path, logs: &[StructuredCaseLog]) -> Result<(), String> {
    let mut lines = String::new();
    for entry in logs {
        let line = serde_json::to_string(entry)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create reference matrix output dir {}: {error}",
                parent.display()
            )
        })?;
    }

    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write reference matrix log {}: {error}",
            output_path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ft_core::{DType, DenseTensor, Device};
    use ft_dispatch::{Value, find_op};
    use ft_nested::JaggedTensor;
    use proptest::prelude::*;

    use super::{
        Contiguity, HarnessConfig, NjtOpInfoError, SampleContext, SampleInput, find_njt_op,
        reference_embedding_bag, run_reference_matrix, unbind_reference,
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

    fn ints(values: &[i64]) -> DenseTensor {
        DenseTensor::from_vec(
            values.iter().map(|&v| v as f64).collect(),
            vec![values.len()],
            DType::I64,
            Device::Cpu,
        )
        .expect("index tensor should build")
    }

    fn quiet_config(seed: u64) -> HarnessConfig {
        HarnessConfig {
            seed: Some(seed),
            log_path: None,
            ..HarnessConfig::default_paths()
        }
    }

    #[test]
    fn batch_marked_operand_broadcasts_per_item() {
        let ctx = SampleContext::new(Device::Cpu, DType::F64, false).with_seed(Some(3));
        let mut rng = ctx.rng(0);
        let nt = super::random_nt_from_dims(&[Some(4), None, Some(16)], &ctx, &mut rng)
            .expect("batch should build");
        let dense = ramp(vec![4, 1, 16], 0.0);
        let sample = SampleInput::new(nt.clone()).with_args(vec![Value::batched(dense.clone(), 0)]);

        let op = find_op("add").expect("add");
        let out = unbind_reference(op, &sample).expect("reference");
        let out = out.as_nested().expect("jagged output");
        assert_eq!(out.batch_size(), 4);
        assert_eq!(out.item_lengths(), nt.item_lengths());
        for (i, item) in out.unbind().expect("unbind").iter().enumerate() {
            let input = nt.select(i).expect("item");
            let row = dense.select(0, i).expect("row");
            assert_eq!(item.shape(), input.shape());
            for r in 0..input.shape()[0] {
                for c in 0..16 {
                    let expected = input.get(&[r, c]).expect("in range")
                        + row.get(&[0, c]).expect("in range");
                    assert_eq!(item.get(&[r, c]).expect("in range"), expected);
                }
            }
        }
    }

    #[test]
    fn batch_and_ragged_reduction_keeps_dims() {
        let nt = JaggedTensor::from_components(&[
            ramp(vec![3, 5], 0.0),
            ramp(vec![6, 5], 100.0),
            ramp(vec![4, 5], 200.0),
        ])
        .expect("batch should pack");
        let sample = SampleInput::new(nt.clone())
            .with_kwarg("dim", Value::IntList(vec![0, 1]))
            .with_kwarg("keepdim", Value::Bool(true));
        let op = find_njt_op("sum").expect("sum");
        let out = op.reference_output(&sample).expect("reference");
        let out = out.as_tensor().expect("dense output");
        assert_eq!(out.shape(), &[1, 1, 5]);
        for c in 0..5 {
            let expected: f64 = nt
                .unbind()
                .expect("unbind")
                .iter()
                .map(|item| {
                    (0..item.shape()[0])
                        .map(|r| item.get(&[r, c]).expect("in range"))
                        .sum::<f64>()
                })
                .sum();
            assert_eq!(out.get(&[0, 0, c]).expect("in range"), expected);
        }
    }

    #[test]
    fn index_put_leaves_unnamed_items_untouched() {
        let nt = JaggedTensor::from_components(&[
            ramp(vec![2, 3], 0.0),
            ramp(vec![3, 3], 10.0),
            ramp(vec![2, 3], 20.0),
        ])
        .expect("batch should pack");
        let sample = SampleInput::new(nt.clone())
            .with_kwarg("indices", Value::List(vec![Value::tensor(ints(&[0, 2]))]))
            .with_kwarg(
                "values",
                Value::tensor(DenseTensor::scalar(1.0, DType::F64, Device::Cpu)),
            );
        let op = find_njt_op("index_put").expect("index_put");
        let out = op.reference_output(&sample).expect("reference");
        let items = out.as_nested().expect("jagged output").unbind().expect("unbind");
        assert!(items[0].to_vec().iter().all(|&v| v == 1.0));
        assert_eq!(items[1].to_vec(), nt.select(1).expect("item").to_vec());
        assert!(items[2].to_vec().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn embedding_bag_reference_is_one_bag_per_item() {
        let weight = ramp(vec![10, 4], 0.0);
        let indices =
            JaggedTensor::from_components(&[ints(&[0, 1, 2, 3]), ints(&[4, 5, 6]), ints(&[7, 8, 9, 0, 1])])
                .expect("indices should pack");
        let sample = SampleInput::new(weight.clone())
            .with_args(vec![Value::Nested(indices.clone())])
            .with_kwarg("mode", Value::Str("sum".to_string()))
            .with_kwarg("per_sample_weights", Value::None);
        let op = find_op("nn.functional.embedding_bag").expect("embedding_bag");
        let out = reference_embedding_bag(op, &sample).expect("reference");
        let out = out.as_tensor().expect("dense output");
        assert_eq!(out.shape(), &[3, 4]);
        for (bag, item) in indices.unbind().expect("unbind").iter().enumerate() {
            for c in 0..4 {
                let expected: f64 = item
                    .to_vec()
                    .iter()
                    .map(|&row| weight.get(&[row as usize, c]).expect("in range"))
                    .sum();
                assert_eq!(out.get(&[bag, c]).expect("in range"), expected);
            }
        }
    }

    #[test]
    fn bmm_reference_matches_per_item_matmul() {
        let nt = JaggedTensor::from_components(&[ramp(vec![2, 3], 0.0), ramp(vec![4, 3], 1.0)])
            .expect("batch should pack");
        let other = ramp(vec![2, 3, 5], 0.5);
        let sample = SampleInput::new(nt.clone()).with_kwarg("mat2", Value::batched(other.clone(), 0));
        let op = find_njt_op("bmm").expect("bmm");
        let out = op.reference_output(&sample).expect("reference");
        let out = out.as_nested().expect("jagged output");
        assert_eq!(out.item_lengths(), vec![2, 4]);
        for (i, item) in out.unbind().expect("unbind").iter().enumerate() {
            assert_eq!(item.shape(), &[nt.item_lengths()[i], 5]);
            let lhs = nt.select(i).expect("item");
            let rhs = other.select(0, i).expect("rhs");
            let rows = lhs.shape()[0];
            let expected: Vec<f64> = (0..rows)
                .flat_map(|r| {
                    let lhs = &lhs;
                    let rhs = &rhs;
                    (0..5).map(move |c| {
                        (0..3)
                            .map(|k| lhs.get(&[r, k]).expect("lhs") * rhs.get(&[k, c]).expect("rhs"))
                            .sum::<f64>()
                    })
                })
                .collect();
            let expected = DenseTensor::from_vec(expected, vec![rows, 5], DType::F64, Device::Cpu)
                .expect("expected product builds");
            assert!(item.allclose(&expected, 1e-12, 1e-12));
        }
    }

    #[test]
    fn unsupported_reference_errors_with_op_name() {
        let op = find_njt_op("cumsum").expect("cumsum");
        assert!(!op.supports_njt);
        let sample = SampleInput::new(ramp(vec![2, 2], 0.0));
        let err = op.reference_output(&sample).expect_err("unsupported");
        assert!(matches!(&err, NjtOpInfoError::Unsupported { op_name } if op_name == "cumsum"));
        assert_eq!(err.reason_code(), "unsupported");
    }

    #[test]
    fn every_supported_op_generates_samples_in_every_layout() {
        for op in super::njt_op_db().values().filter(|op| op.supports_njt) {
            for &contiguity in &op.extra_op_data.contiguity_support {
                let ctx = SampleContext::new(Device::Cpu, DType::F32, false)
                    .with_seed(Some(17))
                    .with_contiguity(Some(contiguity));
                let samples: Vec<SampleInput> = op
                    .sample_inputs(&ctx)
                    .expect("supported op generates")
                    .collect::<Result<_, _>>()
                    .expect("samples build");
                assert!(!samples.is_empty(), "{} {contiguity}", op.full_name());
                for sample in &samples {
                    assert!(
                        sample.driving_nested().is_some(),
                        "{} sample {} has no jagged operand",
                        op.full_name(),
                        sample.label()
                    );
                }
            }
        }
    }

    #[test]
    fn reference_matrix_accounts_for_every_case() {
        let (report, logs) = run_reference_matrix(&quiet_config(23)).expect("matrix runs");
        assert_eq!(report.suite, "njt_reference_matrix");
        assert_eq!(report.cases_total, logs.len());
        assert!(report.cases_passed > 0);
        assert_eq!(
            report.cases_passed + report.cases_skipped + report.cases_failed(),
            report.cases_total
        );
        for log in logs.iter().filter(|log| log.outcome == "skip") {
            assert_eq!(log.reason_code, "invalid_combination");
        }
        let ops: BTreeSet<&str> = logs.iter().map(|log| log.op_name.as_str()).collect();
        assert_eq!(ops.len(), report.ops_total);
        assert!(!ops.contains("cumsum"));
    }

    #[test]
    fn core_ops_pass_in_every_layout() {
        for name in ["abs", "add", "sum", "bmm", "nn.functional.embedding_bag"] {
            let config = HarnessConfig {
                op_filter: Some(name.to_string()),
                ..quiet_config(41)
            };
            let (report, logs) = run_reference_matrix(&config).expect("matrix runs");
            let failures: Vec<String> = logs
                .iter()
                .filter(|log| log.outcome == "fail")
                .map(|log| format!("{}: {:?}", log.scenario_id, log.extra_fields.get("error")))
                .collect();
            assert!(failures.is_empty(), "{name} failures: {failures:#?}");
            assert!(report.cases_passed > 0, "{name} produced no passing cases");
        }

        // transposing the last two dims moves the ragged dim only at rank 3
        let op = find_njt_op("sum").expect("sum");
        let ctx = SampleContext::new(Device::Cpu, DType::F32, false)
            .with_seed(Some(41))
            .with_contiguity(Some(Contiguity::NoncontigTransposed));
        let mut ragged_idxs = BTreeSet::new();
        for sample in op.sample_inputs(&ctx).expect("sum generates") {
            let sample = sample.expect("sample builds");
            let nt = sample.input.as_nested().expect("jagged input");
            ragged_idxs.insert(nt.ragged_idx());
            let result = op.reference_output(&sample);
            if nt.ragged_idx() > 1 {
                assert!(
                    matches!(result, Err(NjtOpInfoError::InvalidCombination { .. })),
                    "{} should skip",
                    sample.label()
                );
            } else {
                assert!(result.is_ok(), "{}: {result:?}", sample.label());
            }
        }
        assert_eq!(ragged_idxs, BTreeSet::from([1, 2]));
    }

    #[test]
    fn case_logs_carry_the_layout_of_each_sample() {
        let config = HarnessConfig {
            op_filter: Some("abs".to_string()),
            contiguity_filter: Some(Contiguity::NoncontigHoles),
            ..quiet_config(13)
        };
        let (_, logs) = run_reference_matrix(&config).expect("matrix runs");
        assert!(!logs.is_empty());
        assert!(logs.iter().all(|log| log.mode == "noncontig_holes"));

        let config = HarnessConfig {
            op_filter: Some("clone".to_string()),
            contiguity_filter: Some(Contiguity::Contig),
            ..quiet_config(13)
        };
        let (_, logs) = run_reference_matrix(&config).expect("matrix runs");
        let modes: BTreeSet<&str> = logs.iter().map(|log| log.mode.as_str()).collect();
        assert_eq!(modes, BTreeSet::from(["contig", "noncontig_holes"]));
        for log in &logs {
            assert_eq!(log.extra_fields.get("requested_layout"), Some(&serde_json::json!("contig")));
        }
        let scenarios: BTreeSet<&str> = logs.iter().map(|log| log.scenario_id.as_str()).collect();
        assert_eq!(scenarios.len(), logs.len());
    }

    #[test]
    fn reference_matrix_writes_jsonl() {
        let output_path = std::env::temp_dir().join(format!(
            "ft_njt_matrix_{}_{}.jsonl",
            std::process::id(),
            line!()
        ));
        let config = HarnessConfig {
            log_path: Some(output_path.clone()),
            op_filter: Some("abs".to_string()),
            contiguity_filter: Some(Contiguity::Contig),
            ..quiet_config(5)
        };
        let (report, _) = run_reference_matrix(&config).expect("matrix runs");
        let raw = std::fs::read_to_string(&output_path).expect("jsonl output should be readable");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), report.cases_total);
        let first: serde_json::Value =
            serde_json::from_str(lines[0]).expect("jsonl line should be valid json");
        for required in [
            "schema_version",
            "scenario_id",
            "seed",
            "mode",
            "env_fingerprint",
            "artifact_refs",
            "replay_command",
            "outcome",
            "reason_code",
            "output",
        ] {
            assert!(first.get(required).is_some(), "missing required key {required}");
        }
        let _ = std::fs::remove_file(output_path);
    }

    proptest! {
        #[test]
        fn unary_reference_preserves_item_lengths(seed in any::<u64>()) {
            let ctx = SampleContext::new(Device::Cpu, DType::F64, false).with_seed(Some(seed));
            let op = find_njt_op("abs").expect("abs");
            for sample in op.sample_inputs(&ctx).expect("abs generates") {
                let sample = sample.expect("sample builds");
                let input = sample.input.as_nested().expect("jagged input").clone();
                let out = op.reference_output(&sample).expect("reference");
                let out = out.as_nested().expect("jagged output");
                prop_assert_eq!(out.item_lengths(), input.item_lengths());
                for (lhs, rhs) in out.unbind().expect("unbind").iter().zip(input.unbind().expect("unbind")) {
                    for (got, raw) in lhs.to_vec().into_iter().zip(rhs.to_vec()) {
                        prop_assert_eq!(got, raw.abs());
                    }
                }
            }
        }

        #[test]
        fn ragged_reductions_stack_to_batch_rows(seed in any::<u64>(), keepdim in any::<bool>()) {
            let ctx = SampleContext::new(Device::Cpu, DType::F64, false).with_seed(Some(seed));
            let mut rng = ctx.rng(0);
            let nt = super::random_nt_from_dims(&[Some(3), None, Some(4)], &ctx, &mut rng)
                .expect("batch builds");
            let sample = SampleInput::new(nt)
                .with_kwarg("dim", Value::Int(1))
                .with_kwarg("keepdim", Value::Bool(keepdim));
            let op = find_njt_op("amax").expect("amax");
            let out = op.reference_output(&sample).expect("reference");
            let out = out.as_tensor().expect("dense output");
            let expected: &[usize] = if keepdim { &[3, 1, 4] } else { &[3, 4] };
            prop_assert_eq!(out.shape(), expected);
        }
    }
}
