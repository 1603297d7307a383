#![forbid(unsafe_code)]

use std::path::PathBuf;

use ft_conformance::{Contiguity, HarnessConfig, run_reference_matrix};
use ft_core::DType;
use serde_json::json;

const USAGE: &str = "usage: run_njt_matrix [--op NAME] [--contiguity contig|noncontig_transposed|noncontig_holes] [--dtype float32|float64] [--seed N] [--output path] [--print-full-log]";

fn main() -> Result<(), String> {
    let mut config = HarnessConfig::default_paths();
    let mut print_full_log = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--op" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--op requires a full op name (e.g., max.reduction_with_dim)".to_string())?;
                config.op_filter = Some(value);
            }
            "--contiguity" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--contiguity requires a layout name".to_string())?;
                config.contiguity_filter = Some(parse_contiguity(value.as_str())?);
            }
            "--dtype" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--dtype requires one of: float32|float64".to_string())?;
                config.dtype = parse_dtype(value.as_str())?;
            }
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--seed requires an unsigned integer".to_string())?;
                let seed = value
                    .parse()
                    .map_err(|error| format!("invalid seed '{value}': {error}"))?;
                config.seed = Some(seed);
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                config.log_path = Some(PathBuf::from(value));
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let (report, _) = run_reference_matrix(&config)?;

    if print_full_log && let Some(path) = &config.log_path {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            format!(
                "failed to read generated reference matrix log {}: {error}",
                path.display()
            )
        })?;
        print!("{raw}");
        return Ok(());
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": if report.cases_failed() == 0 { "ok" } else { "failed" },
            "suite": report.suite,
            "output_path": config.log_path.as_ref().map(|path| path.display().to_string()),
            "ops_total": report.ops_total,
            "cases_total": report.cases_total,
            "cases_passed": report.cases_passed,
            "cases_skipped": report.cases_skipped,
            "cases_failed": report.cases_failed(),
            "seed": config.seed,
            "op_filter": config.op_filter,
            "contiguity_filter": config.contiguity_filter.map(Contiguity::as_str),
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(())
}

fn parse_contiguity(raw: &str) -> Result<Contiguity, String> {
    Contiguity::ALL
        .into_iter()
        .find(|contiguity| contiguity.as_str() == raw)
        .ok_or_else(|| {
            format!("unsupported contiguity '{raw}'; expected contig|noncontig_transposed|noncontig_holes")
        })
}

fn parse_dtype(raw: &str) -> Result<DType, String> {
    match raw {
        "float32" | "f32" => Ok(DType::F32),
        "float64" | "f64" => Ok(DType::F64),
        _ => Err(format!("unsupported dtype '{raw}'; expected float32|float64")),
    }
}
