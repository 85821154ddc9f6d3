use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tg_runtime::{EvidenceEntry, EvidenceKind, RunContext};

use crate::HarnessError;

pub const RUN_LOG_SCHEMA_VERSION: &str = "tg-run-log-v1";

/// One JSONL line of `<name>_run.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredRunLog {
    pub schema_version: String,
    pub ts_unix_ms: u64,
    pub run_id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    pub outcome: String,
    pub reason_code: String,
    pub summary: String,
    pub replay_command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredRunLog {
    #[must_use]
    pub fn from_evidence(run_id: &str, entry: &EvidenceEntry, replay_command: &str) -> Self {
        Self {
            schema_version: RUN_LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms: entry.ts_unix_ms,
            run_id: run_id.to_string(),
            stage: entry.kind.label().to_string(),
            artifact: entry.artifact.clone(),
            token_count: entry.token_count,
            outcome: if entry.failed { "fail" } else { "pass" }.to_string(),
            reason_code: reason_code(entry.kind, entry.failed).to_string(),
            summary: entry.summary.clone(),
            replay_command: replay_command.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

#[must_use]
pub fn reason_code(kind: EvidenceKind, failed: bool) -> &'static str {
    if failed {
        return match kind {
            EvidenceKind::Verify => "gold_mismatch",
            EvidenceKind::Write => "artifact_write_failed",
            _ => "stage_failed",
        };
    }
    match kind {
        EvidenceKind::Policy => "run_policy_recorded",
        EvidenceKind::Generate => "tensor_generated",
        EvidenceKind::Compute => "oracle_ofmap_computed",
        EvidenceKind::Serialize => "tile_order_serialized",
        EvidenceKind::Write => "artifact_persisted",
        EvidenceKind::Verify => "gold_matched",
    }
}

/// Renders every ledger entry of `ctx` as one compact JSON line. The first
/// line carries the resolved space so a log alone is enough to replay a run.
pub fn run_log_lines(
    ctx: &RunContext,
    replay_command: &str,
    space: &Value,
) -> Result<Vec<String>, HarnessError> {
    ctx.ledger()
        .entries()
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let mut line = StructuredRunLog::from_evidence(ctx.run_id(), entry, replay_command);
            if index == 0 {
                let run_outcome = if ctx.ledger().has_failures() {
                    "fail"
                } else {
                    "pass"
                };
                line = line
                    .with_extra("space", space.clone())
                    .with_extra("run_outcome", Value::from(run_outcome));
            }
            serde_json::to_string(&line).map_err(|error| HarnessError::Config {
                reason: format!("failed to encode run log line: {error}"),
            })
        })
        .collect()
}
