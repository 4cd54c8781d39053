//! Repository port for run metrics persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    AttemptLog, ReconciliationAttempt, ReconciliationFailure, Run, Step, VerificationOutcome,
};

/// Filter for listing runs.
#[derive(Debug, Default, Clone)]
pub struct RunFilter {
    pub run_id: Option<String>,
    pub framework_id: Option<String>,
}

/// Everything written by one reconciliation, applied atomically.
#[derive(Debug)]
pub struct AttemptCommit<'a> {
    pub run_id: &'a str,
    /// Version read before the attempt was computed.
    pub expected_version: u64,
    pub attempt: &'a ReconciliationAttempt,
    pub outcome: &'a VerificationOutcome,
    /// Steps with usage backfilled from `attempt`.
    pub steps: &'a [Step],
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Create a new run together with any steps it already carries.
    async fn create_run(&self, run: &Run) -> DomainResult<()>;

    /// Get a run and its steps by ID.
    async fn get_run(&self, run_id: &str) -> DomainResult<Option<Run>>;

    /// List runs with optional filter, oldest first.
    async fn list_runs(&self, filter: RunFilter) -> DomainResult<Vec<Run>>;

    /// Insert a newly started step.
    async fn insert_step(&self, run_id: &str, step: &Step) -> DomainResult<()>;

    /// Close a step's time window.
    async fn close_step(&self, run_id: &str, step_number: u32, end_ts: DateTime<Utc>) -> DomainResult<()>;

    /// Load the attempt log of a run.
    async fn load_attempts(&self, run_id: &str) -> DomainResult<AttemptLog>;

    /// Load the failure journal of a run.
    async fn load_failures(&self, run_id: &str) -> DomainResult<Vec<ReconciliationFailure>>;

    /// Append an attempt and persist derived state in one transaction.
    ///
    /// Fails with `ConcurrencyConflict` if the run changed since
    /// `expected_version` was read. Returns the new version.
    async fn commit_attempt(&self, commit: AttemptCommit<'_>) -> DomainResult<u64>;

    /// Journal a pass that produced no attempt.
    async fn record_failure(&self, run_id: &str, failure: &ReconciliationFailure) -> DomainResult<()>;

    /// Clear attempt history and return the run and its steps to `pending`.
    async fn reset_run(&self, run_id: &str) -> DomainResult<()>;
}
