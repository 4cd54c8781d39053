//! Run metrics store service.
//!
//! Wraps a `RunRepository` with the verification state machine so every
//! write persists a freshly derived status and every read can re-derive it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AttemptLog, ReconciliationAttempt, ReconciliationFailure, Run, RunRecord, Step, StepUsage,
    UsageValue, VerificationOutcome, VerificationStatus,
};
use crate::domain::ports::{AttemptCommit, RunFilter, RunRepository};
use crate::services::verification::VerificationStateMachine;

/// An attempt that was appended, and the status it produced.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedAttempt {
    pub attempt: ReconciliationAttempt,
    pub outcome: VerificationOutcome,
    pub version: u64,
}

pub struct RunMetricsStore<R: RunRepository> {
    repo: Arc<R>,
    machine: VerificationStateMachine,
}

impl<R: RunRepository> RunMetricsStore<R> {
    pub fn new(repo: Arc<R>, machine: VerificationStateMachine) -> Self {
        Self { repo, machine }
    }

    pub fn machine(&self) -> &VerificationStateMachine {
        &self.machine
    }

    /// Persist a run with every step reset to unknown usage and `pending`.
    pub async fn initialize_run(&self, mut run: Run) -> DomainResult<Run> {
        for step in &mut run.steps {
            step.tokens_in = UsageValue::Unknown;
            step.tokens_out = UsageValue::Unknown;
            step.api_calls = UsageValue::Unknown;
            step.verification_status = VerificationStatus::Pending;
        }
        run.verification_status = VerificationStatus::Pending;
        run.verification_message = None;
        run.last_reconciled_at = None;
        run.version = 0;

        self.repo.create_run(&run).await?;
        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> DomainResult<Option<Run>> {
        self.repo.get_run(run_id).await
    }

    pub async fn require(&self, run_id: &str) -> DomainResult<Run> {
        self.get(run_id)
            .await?
            .ok_or_else(|| DomainError::RunNotFound(run_id.to_string()))
    }

    pub async fn list(&self, filter: RunFilter) -> DomainResult<Vec<Run>> {
        self.repo.list_runs(filter).await
    }

    pub async fn attempts(&self, run_id: &str) -> DomainResult<AttemptLog> {
        self.repo.load_attempts(run_id).await
    }

    pub async fn failures(&self, run_id: &str) -> DomainResult<Vec<ReconciliationFailure>> {
        self.repo.load_failures(run_id).await
    }

    /// Re-derive the status of `run` from its persisted attempt log.
    pub async fn evaluate(&self, run: &Run, now: DateTime<Utc>) -> DomainResult<VerificationOutcome> {
        let log = self.repo.load_attempts(&run.run_id).await?;
        Ok(self.machine.evaluate(&log, run.age(now)))
    }

    /// Append one measurement of `run` and persist the recomputed status
    /// with per-step backfill.
    ///
    /// `run` must be the snapshot the measurement was taken from; its
    /// version guards the write. A concurrent writer yields
    /// `ConcurrencyConflict` and nothing is written.
    pub async fn record_attempt(
        &self,
        run: &Run,
        step_usage: Vec<StepUsage>,
        now: DateTime<Utc>,
    ) -> DomainResult<RecordedAttempt> {
        let mut log = self.repo.load_attempts(&run.run_id).await?;
        let (index, timestamp) = log.next_slot(now);
        let attempt = ReconciliationAttempt::from_step_usage(index, timestamp, step_usage);
        log.append(attempt.clone())?;

        let outcome = self.machine.evaluate(&log, run.age(timestamp));
        let steps = backfill_steps(&run.steps, &attempt, outcome.status);

        let version = self
            .repo
            .commit_attempt(AttemptCommit {
                run_id: &run.run_id,
                expected_version: run.version,
                attempt: &attempt,
                outcome: &outcome,
                steps: &steps,
            })
            .await?;

        if outcome.status == VerificationStatus::Warning {
            warn!(run_id = %run.run_id, attempt = index, message = %outcome.message, "Usage decreased between attempts");
        } else {
            debug!(run_id = %run.run_id, attempt = index, status = %outcome.status, "Attempt recorded");
        }

        Ok(RecordedAttempt { attempt, outcome, version })
    }

    /// Journal a pass that produced no attempt.
    pub async fn record_failure(
        &self,
        run_id: &str,
        kind: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let failure = ReconciliationFailure {
            timestamp: now,
            kind: kind.to_string(),
            reason: reason.to_string(),
        };
        self.repo.record_failure(run_id, &failure).await
    }

    /// Return a run to `pending` and clear its attempt history.
    pub async fn reset(&self, run_id: &str) -> DomainResult<()> {
        self.repo.reset_run(run_id).await?;
        info!(run_id, "Run reset to pending");
        Ok(())
    }

    /// The persisted record shape for a run.
    pub async fn export(&self, run_id: &str, now: DateTime<Utc>) -> DomainResult<RunRecord> {
        let run = self.require(run_id).await?;
        let log = self.repo.load_attempts(run_id).await?;
        let failures = self.repo.load_failures(run_id).await?;
        // The cached status goes stale as the run ages; evaluate afresh.
        let outcome = self.machine.evaluate(&log, run.age(now));
        Ok(RunRecord::from_parts(&run, &log, &outcome, failures))
    }
}

/// Copy per-step usage from `attempt` onto the run's steps.
///
/// Steps without tokens in this attempt are marked `data_not_available`;
/// the rest take the run's status. Steps the attempt did not measure are
/// left untouched.
pub fn backfill_steps(
    steps: &[Step],
    attempt: &ReconciliationAttempt,
    run_status: VerificationStatus,
) -> Vec<Step> {
    steps
        .iter()
        .map(|step| {
            let Some(usage) = attempt
                .step_usage
                .iter()
                .find(|u| u.step_number == step.step_number)
            else {
                return step.clone();
            };
            Step {
                tokens_in: UsageValue::Measured(usage.tokens_in),
                tokens_out: UsageValue::Measured(usage.tokens_out),
                api_calls: UsageValue::Measured(usage.api_calls),
                verification_status: if usage.has_tokens() {
                    run_status
                } else {
                    VerificationStatus::DataNotAvailable
                },
                ..step.clone()
            }
        })
        .collect()
}
