#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Reject,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingTimestamp,
    GridCardinality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts_unix_ms: u64,
    pub mode: RuntimeMode,
    pub action: DecisionAction,
    pub issue: CompatibilityIssue,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceLedger {
    records: Vec<DecisionRecord>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One JSON object per line, oldest first.
    pub fn to_jsonl(&self) -> Result<String, RuntimeError> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// How a resample call treats recoverable input problems and how large a
/// grid it admits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResamplePolicy {
    pub mode: RuntimeMode,
    pub max_grid_rows: Option<usize>,
}

impl ResamplePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            max_grid_rows: None,
        }
    }

    #[must_use]
    pub fn hardened(max_grid_rows: Option<usize>) -> Self {
        Self {
            mode: RuntimeMode::Hardened,
            max_grid_rows,
        }
    }

    /// Strict mode fails on a missing date; hardened mode drops those rows
    /// from aggregation.
    pub fn decide_missing_timestamps(
        &self,
        column: &str,
        missing: usize,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        let action = match self.mode {
            RuntimeMode::Strict => DecisionAction::Reject,
            RuntimeMode::Hardened => DecisionAction::Repair,
        };
        self.record(
            ledger,
            action,
            IssueKind::MissingTimestamp,
            column,
            format!("missing_rows={missing}"),
        )
    }

    pub fn decide_grid_admission(
        &self,
        grid_rows: usize,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        let cap = self.max_grid_rows.unwrap_or(usize::MAX);
        let action = if grid_rows <= cap {
            DecisionAction::Allow
        } else {
            DecisionAction::Reject
        };
        self.record(
            ledger,
            action,
            IssueKind::GridCardinality,
            "grid_estimator",
            format!("grid_rows={grid_rows} cap={cap}"),
        )
    }

    fn record(
        &self,
        ledger: &mut EvidenceLedger,
        action: DecisionAction,
        kind: IssueKind,
        subject: &str,
        detail: String,
    ) -> DecisionAction {
        ledger.push(DecisionRecord {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            mode: self.mode,
            action,
            issue: CompatibilityIssue {
                kind,
                subject: subject.to_owned(),
                detail,
            },
        });
        action
    }
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(u64::try_from(ms).unwrap_or(u64::MAX))
}
