use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sample::Contiguity;

pub const LOG_SCHEMA_VERSION: &str = "ft-njt-case-log-v1";

/// One JSONL line per reference-matrix case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub scenario_id: String,
    pub fixture_id: String,
    pub op_name: String,
    pub mode: String,
    pub seed: Option<u64>,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub duration_ms: u64,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        op_name: &str,
        case_name: &str,
        mode: Contiguity,
        seed: Option<u64>,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        let ts_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis());
        Self {
            schema_version: LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms,
            suite_id: suite_id.to_string(),
            scenario_id: format!("{suite_id}/{}/{case_name}", mode_label(mode)),
            fixture_id: op_name.to_string(),
            op_name: op_name.to_string(),
            mode: mode_label(mode).to_string(),
            seed,
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            duration_ms: 0,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }
}

#[must_use]
pub fn mode_label(mode: Contiguity) -> &'static str {
    mode.as_str()
}

fn env_fingerprint() -> String {
    format!(
        "{}-{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    )
}
