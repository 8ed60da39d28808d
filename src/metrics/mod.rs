//! Persisted per-step and per-run metrics
//!
//! `metrics.json` at the run root is the source of truth for token totals.
//! Step execution only records timing, HITL and API-call counts; tokens stay
//! zero until the usage reconciler backfills them.

use crate::error::WorkspaceError;
use crate::workspace::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const RUN_METRICS_FILE: &str = "metrics.json";

/// One step's persisted record (also written to `sprint_NNN/metrics.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: u32,
    pub step_id: String,
    pub success: bool,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub hitl_count: u32,
    #[serde(default)]
    pub api_calls: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub downtime_probes: u64,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_error: Option<String>,
}

impl StepRecord {
    pub fn has_tokens(&self) -> bool {
        self.tokens_in > 0 || self.tokens_out > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub total_duration_seconds: f64,
    pub avg_step_duration_seconds: f64,
    pub total_hitl: u64,
    pub total_api_calls: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cached_tokens: u64,
    /// Fraction of steps that succeeded without any clarification round
    pub autr: f64,
    /// `autr / ln(1 + total_tokens_in)`, 0 while tokens are unknown
    pub aei: f64,
}

impl AggregateMetrics {
    pub fn from_steps(steps: &[StepRecord]) -> Self {
        let steps_total = steps.len();
        let steps_completed = steps.iter().filter(|s| s.success).count();
        let total_duration_seconds: f64 = steps.iter().map(|s| s.duration_seconds).sum();
        let total_tokens_in: u64 = steps.iter().map(|s| s.tokens_in).sum();
        let autonomous = steps
            .iter()
            .filter(|s| s.success && s.hitl_count == 0)
            .count();

        let autr = if steps_total == 0 {
            0.0
        } else {
            autonomous as f64 / steps_total as f64
        };
        let aei = if total_tokens_in == 0 {
            0.0
        } else {
            autr / (1.0 + total_tokens_in as f64).ln()
        };

        Self {
            steps_total,
            steps_completed,
            steps_failed: steps_total - steps_completed,
            total_duration_seconds,
            avg_step_duration_seconds: if steps_total == 0 {
                0.0
            } else {
                total_duration_seconds / steps_total as f64
            },
            total_hitl: steps.iter().map(|s| s.hitl_count as u64).sum(),
            total_api_calls: steps.iter().map(|s| s.api_calls).sum(),
            total_tokens_in,
            total_tokens_out: steps.iter().map(|s| s.tokens_out).sum(),
            total_cached_tokens: steps.iter().map(|s| s.cached_tokens).sum(),
            autr,
            aei,
        }
    }

    /// Look up a metric by its serialized field name
    pub fn value(&self, name: &str) -> Option<f64> {
        let value = serde_json::to_value(self).ok()?;
        value.get(name)?.as_f64()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    None,
    Pending,
    DataNotAvailable,
    Verified,
}

impl VerificationStatus {
    /// Position in the forward-only progression.
    ///
    /// `DataNotAvailable` shares a rank with `Pending`: usage data can land
    /// late, so a later pass may still move it back to pending on the way
    /// to verified.
    pub fn rank(self) -> u8 {
        match self {
            VerificationStatus::None => 0,
            VerificationStatus::Pending | VerificationStatus::DataNotAvailable => 1,
            VerificationStatus::Verified => 2,
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationStatus::None => write!(f, "none"),
            VerificationStatus::Pending => write!(f, "pending"),
            VerificationStatus::DataNotAvailable => write!(f, "data_not_available"),
            VerificationStatus::Verified => write!(f, "verified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAttempt {
    pub timestamp: DateTime<Utc>,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    #[serde(default)]
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub attempts: Vec<ReconciliationAttempt>,
    #[serde(default)]
    pub stable_attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_tokens_in: u64,
    #[serde(default)]
    pub total_tokens_out: u64,
    #[serde(default)]
    pub steps_with_tokens: usize,
    #[serde(default)]
    pub total_steps: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Contents of `<run_dir>/metrics.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub framework: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub aggregate_metrics: AggregateMetrics,
    #[serde(default)]
    pub usage_api_reconciliation: ReconciliationRecord,
}

impl RunMetrics {
    pub fn new(
        run_id: &str,
        framework: &str,
        status: RunStatus,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        steps: Vec<StepRecord>,
    ) -> Self {
        let aggregate_metrics = AggregateMetrics::from_steps(&steps);
        let usage_api_reconciliation = ReconciliationRecord {
            total_steps: steps.len(),
            ..Default::default()
        };
        Self {
            run_id: run_id.to_string(),
            framework: framework.to_string(),
            status,
            start_time,
            end_time,
            steps,
            aggregate_metrics,
            usage_api_reconciliation,
        }
    }

    pub fn recompute(&mut self) {
        self.aggregate_metrics = AggregateMetrics::from_steps(&self.steps);
        let record = &mut self.usage_api_reconciliation;
        record.total_tokens_in = self.aggregate_metrics.total_tokens_in;
        record.total_tokens_out = self.aggregate_metrics.total_tokens_out;
        record.steps_with_tokens = self.steps.iter().filter(|s| s.has_tokens()).count();
        record.total_steps = self.steps.len();
    }

    pub fn load(run_dir: &Path) -> Result<Self, WorkspaceError> {
        let path = run_dir.join(RUN_METRICS_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| WorkspaceError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, run_dir: &Path) -> Result<(), WorkspaceError> {
        write_json_atomic(&run_dir.join(RUN_METRICS_FILE), self)
    }
}
