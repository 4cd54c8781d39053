//! Exported per-run record.
//!
//! This is the stable JSON shape consumers read: the status re-derived at
//! export time, backfilled steps, and the append-only attempt history.

use serde::{Deserialize, Serialize};

use super::attempt::{AttemptLog, ReconciliationFailure};
use super::run::{Run, UsageValue, VerificationStatus};
use super::verification::VerificationOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: u32,
    /// Unix seconds.
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
    pub tokens_in: UsageValue,
    pub tokens_out: UsageValue,
    pub api_calls: UsageValue,
    pub verification_status: VerificationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Unix seconds.
    pub timestamp: i64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub steps_with_tokens: u32,
    pub total_steps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReconciliationRecord {
    pub attempts: Vec<AttemptRecord>,
    pub verification_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ReconciliationFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub framework_id: String,
    pub verification_status: VerificationStatus,
    pub steps: Vec<StepRecord>,
    pub usage_reconciliation: UsageReconciliationRecord,
}

impl RunRecord {
    /// Build the record from stored state and a fresh evaluation of `log`.
    ///
    /// Steps carrying usage take the evaluated status; the rest keep what
    /// backfill gave them.
    pub fn from_parts(
        run: &Run,
        log: &AttemptLog,
        outcome: &VerificationOutcome,
        failures: Vec<ReconciliationFailure>,
    ) -> Self {
        let mut steps: Vec<StepRecord> = run
            .steps
            .iter()
            .map(|s| StepRecord {
                step_number: s.step_number,
                start_timestamp: s.start_ts.timestamp(),
                end_timestamp: s.end_ts.map(|t| t.timestamp()),
                tokens_in: s.tokens_in,
                tokens_out: s.tokens_out,
                api_calls: s.api_calls,
                verification_status: if s.has_data() { outcome.status } else { s.verification_status },
            })
            .collect();
        steps.sort_by_key(|s| s.step_number);

        let attempts = log
            .iter()
            .map(|a| AttemptRecord {
                timestamp: a.timestamp.timestamp(),
                total_tokens_in: a.tokens_in,
                total_tokens_out: a.tokens_out,
                steps_with_tokens: a.steps_with_data,
                total_steps: a.total_steps,
            })
            .collect();

        Self {
            run_id: run.run_id.clone(),
            framework_id: run.framework_id.clone(),
            verification_status: outcome.status,
            steps,
            usage_reconciliation: UsageReconciliationRecord {
                attempts,
                verification_message: (!log.is_empty()).then(|| outcome.message.clone()),
                failures,
            },
        }
    }
}
