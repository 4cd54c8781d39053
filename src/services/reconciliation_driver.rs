//! Reconciliation driver.
//!
//! One pass discovers runs whose end time falls inside the reconciliation
//! age window, re-measures every step of each against the metering API,
//! and appends the result as a new attempt. Runs are independent: a
//! failure in one is journalled and the pass moves on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult, ReconcileError};
use crate::domain::models::{
    Config, MeteringConfig, ReconciliationConfig, RetryConfig, Run, StepUsage, VerificationOutcome,
    VerificationStatus,
};
use crate::domain::ports::{
    AggregateResult, AggregateUsage, Credential, MeteringClient, RunFilter, RunRepository,
    TimeWindow, UnavailableReason,
};
use crate::services::metrics_store::{RecordedAttempt, RunMetricsStore};

/// Which runs a pass should consider.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Reconcile exactly this run, ignoring the age window.
    pub run_id: Option<String>,
    pub framework_id: Option<String>,
    /// Include runs that are already verified.
    pub force: bool,
    pub min_age: Option<Duration>,
    pub max_age: Option<Duration>,
}

impl Selection {
    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }
}

/// Why a run is or is not reconciled in this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "eligibility", rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    AlreadyVerified,
    TooRecent { remaining_min: i64 },
    TooOld { age_hours: i64 },
    InProgress,
    NoSteps,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

impl std::fmt::Display for Eligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eligible => f.write_str("eligible"),
            Self::AlreadyVerified => f.write_str("already verified"),
            Self::TooRecent { remaining_min } => write!(f, "too recent (eligible in {remaining_min} min)"),
            Self::TooOld { age_hours } => write!(f, "too old ({age_hours} h)"),
            Self::InProgress => f.write_str("in progress"),
            Self::NoSteps => f.write_str("no steps"),
        }
    }
}

/// A discovered run with its re-derived status.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    #[serde(skip)]
    pub run: Run,
    pub run_id: String,
    pub framework_id: String,
    pub age_min: i64,
    pub status: VerificationStatus,
    pub message: String,
    #[serde(flatten)]
    pub eligibility: Eligibility,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Reconciled {
        attempt_index: u32,
        tokens_in: u64,
        tokens_out: u64,
        status: VerificationStatus,
        message: String,
    },
    Failed {
        kind: String,
        error: String,
        /// The credential itself was refused or missing.
        #[serde(skip)]
        credential_fatal: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub framework_id: String,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RunOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRun {
    pub run_id: String,
    #[serde(flatten)]
    pub eligibility: Eligibility,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    pub reconciled: Vec<RunReport>,
    pub skipped: Vec<SkippedRun>,
}

impl PassSummary {
    pub fn failed(&self) -> usize {
        self.reconciled.iter().filter(|r| r.is_failure()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.reconciled.len() - self.failed()
    }

    pub fn count_with_status(&self, status: VerificationStatus) -> usize {
        self.reconciled
            .iter()
            .filter(|r| matches!(&r.outcome, RunOutcome::Reconciled { status: s, .. } if *s == status))
            .count()
    }

    /// 0 when nothing failed, 2 when every failure was a credential
    /// problem or no selected run succeeded, 1 on partial failure.
    pub fn exit_code(&self) -> i32 {
        let failures: Vec<&RunOutcome> = self
            .reconciled
            .iter()
            .map(|r| &r.outcome)
            .filter(|o| matches!(o, RunOutcome::Failed { .. }))
            .collect();
        if failures.is_empty() {
            return 0;
        }
        let all_fatal = failures
            .iter()
            .all(|o| matches!(o, RunOutcome::Failed { credential_fatal: true, .. }));
        if all_fatal || failures.len() == self.reconciled.len() {
            2
        } else {
            1
        }
    }
}

/// Metering secrets by credential name, read once per process.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    credentials: HashMap<String, Credential>,
}

impl CredentialStore {
    /// Resolve every configured credential from its environment variable.
    /// Unset or empty variables leave the credential unresolved.
    pub fn from_config(config: &MeteringConfig) -> Self {
        let credentials = config
            .credentials
            .iter()
            .filter_map(|(name, var)| match std::env::var(var) {
                Ok(secret) if !secret.trim().is_empty() => Some((name.clone(), Credential::new(name, secret))),
                _ => {
                    debug!(credential = %name, env = %var, "Credential variable not set");
                    None
                }
            })
            .collect();
        Self { credentials }
    }

    pub fn from_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            credentials: credentials.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Credential, ReconcileError> {
        self.credentials
            .get(name)
            .cloned()
            .ok_or_else(|| ReconcileError::MissingCredential(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Per-run locks serialising reconciliation of one run inside a process.
///
/// An entry lives only while some task holds or waits for it.
#[derive(Clone, Default)]
pub struct RunLocks {
    inner: Arc<std::sync::Mutex<LockMap>>,
}

/// Held lock on one run; releases the map entry when the last user drops.
pub struct RunLockGuard {
    run_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<std::sync::Mutex<LockMap>>,
}

impl RunLocks {
    pub async fn acquire(&self, run_id: &str) -> RunLockGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(run_id.to_string()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        RunLockGuard {
            run_id: run_id.to_string(),
            lock,
            guard: Some(guard),
            map: self.inner.clone(),
        }
    }

    /// Number of runs currently locked or awaited.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        // Release the mutex before checking, so waiters are counted correctly.
        self.guard.take();
        let mut map = self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this guard still reference the lock.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.run_id);
        }
    }
}

pub struct ReconciliationDriver<R: RunRepository, M: MeteringClient> {
    store: Arc<RunMetricsStore<R>>,
    client: Arc<M>,
    credentials: CredentialStore,
    reconciliation: ReconciliationConfig,
    retry: RetryConfig,
    filter: Option<String>,
    locks: RunLocks,
}

impl<R: RunRepository, M: MeteringClient> ReconciliationDriver<R, M> {
    pub fn new(
        store: Arc<RunMetricsStore<R>>,
        client: Arc<M>,
        credentials: CredentialStore,
        config: &Config,
    ) -> Self {
        Self {
            store,
            client,
            credentials,
            reconciliation: config.reconciliation.clone(),
            retry: config.retry.clone(),
            filter: config.metering.filter.clone(),
            locks: RunLocks::default(),
        }
    }

    pub fn store(&self) -> &RunMetricsStore<R> {
        &self.store
    }

    /// Classify every run matching the selection.
    pub async fn discover(&self, selection: &Selection, now: DateTime<Utc>) -> DomainResult<Vec<Candidate>> {
        let runs = self
            .store
            .list(RunFilter {
                run_id: selection.run_id.clone(),
                framework_id: selection.framework_id.clone(),
            })
            .await?;

        if let Some(run_id) = &selection.run_id {
            if runs.is_empty() {
                return Err(DomainError::RunNotFound(run_id.clone()));
            }
        }

        let mut candidates = Vec::with_capacity(runs.len());
        for run in runs {
            // Never trust the cached column; re-derive from the log.
            let outcome = self.store.evaluate(&run, now).await?;
            let eligibility = self.eligibility(&run, &outcome, selection, now);
            candidates.push(Candidate {
                run_id: run.run_id.clone(),
                framework_id: run.framework_id.clone(),
                age_min: run.age(now).num_minutes(),
                status: outcome.status,
                message: outcome.message,
                eligibility,
                next_eligible_at: outcome.next_eligible_at,
                run,
            });
        }
        Ok(candidates)
    }

    fn eligibility(
        &self,
        run: &Run,
        outcome: &VerificationOutcome,
        selection: &Selection,
        now: DateTime<Utc>,
    ) -> Eligibility {
        if run.steps.is_empty() {
            return Eligibility::NoSteps;
        }
        if run.open_step().is_some() {
            return Eligibility::InProgress;
        }
        if outcome.is_verified() && !selection.force {
            return Eligibility::AlreadyVerified;
        }
        if selection.run_id.is_some() {
            return Eligibility::Eligible;
        }

        let min_age = selection.min_age.unwrap_or_else(|| self.reconciliation.min_age());
        let max_age = selection.max_age.unwrap_or_else(|| self.reconciliation.max_age());
        let age = run.age(now);
        if age < min_age {
            let remaining = min_age - age;
            // Round up so "0 min" is never shown for a run that is still waiting.
            let remaining_min = (remaining.num_seconds() + 59) / 60;
            return Eligibility::TooRecent { remaining_min };
        }
        if age > max_age {
            return Eligibility::TooOld { age_hours: age.num_hours() };
        }
        Eligibility::Eligible
    }

    /// Run one reconciliation pass at `now`.
    pub async fn reconcile(&self, selection: &Selection, now: DateTime<Utc>) -> DomainResult<PassSummary> {
        let candidates = self.discover(selection, now).await?;
        let (eligible, skipped): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| c.eligibility.is_eligible());

        let mut summary = PassSummary {
            reconciled: Vec::with_capacity(eligible.len()),
            skipped: skipped
                .into_iter()
                .map(|c| SkippedRun { run_id: c.run_id, eligibility: c.eligibility })
                .collect(),
        };

        info!(
            eligible = eligible.len(),
            skipped = summary.skipped.len(),
            "Starting reconciliation pass"
        );

        let semaphore = Semaphore::new(self.reconciliation.max_concurrent_runs.max(1));
        let poisoned: Mutex<HashSet<String>> = Mutex::new(HashSet::new());

        let work = eligible.into_iter().map(|candidate| {
            let semaphore = &semaphore;
            let poisoned = &poisoned;
            async move {
                let _permit = semaphore.acquire().await;
                self.reconcile_run(candidate.run, now, poisoned).await
            }
        });
        summary.reconciled = join_all(work).await;

        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            verified = summary.count_with_status(VerificationStatus::Verified),
            "Reconciliation pass finished"
        );
        debug!(held_locks = self.locks.len(), "Run locks after pass");
        Ok(summary)
    }

    async fn reconcile_run(
        &self,
        run: Run,
        now: DateTime<Utc>,
        poisoned: &Mutex<HashSet<String>>,
    ) -> RunReport {
        let _guard = self.locks.acquire(&run.run_id).await;
        let run_id = run.run_id.clone();
        let framework_id = run.framework_id.clone();

        let result = if poisoned.lock().await.contains(&run.credential) {
            Err(ReconcileError::Authorization {
                credential: run.credential.clone(),
                message: "rejected earlier in this pass".to_string(),
            })
        } else {
            self.measure_and_record(run.clone(), now).await
        };

        let outcome = match result {
            Ok(recorded) => {
                info!(
                    run_id = %run_id,
                    attempt = recorded.attempt.attempt_index,
                    status = %recorded.outcome.status,
                    "Run reconciled"
                );
                RunOutcome::Reconciled {
                    attempt_index: recorded.attempt.attempt_index,
                    tokens_in: recorded.attempt.tokens_in,
                    tokens_out: recorded.attempt.tokens_out,
                    status: recorded.outcome.status,
                    message: recorded.outcome.message,
                }
            }
            Err(err) => {
                warn!(run_id = %run_id, kind = err.kind(), error = %err, "Run reconciliation failed");
                if err.poisons_credential() {
                    poisoned.lock().await.insert(run.credential.clone());
                }
                if let Err(journal_err) = self
                    .store
                    .record_failure(&run_id, err.kind(), &err.to_string(), now)
                    .await
                {
                    warn!(run_id = %run_id, error = %journal_err, "Failed to journal reconciliation failure");
                }
                RunOutcome::Failed {
                    kind: err.kind().to_string(),
                    error: err.to_string(),
                    credential_fatal: err.poisons_credential(),
                }
            }
        };

        RunReport { run_id, framework_id, outcome }
    }

    async fn measure_and_record(&self, run: Run, now: DateTime<Utc>) -> Result<RecordedAttempt, ReconcileError> {
        let credential = self.credentials.resolve(&run.credential)?;

        let timeout_secs = self.reconciliation.run_timeout_secs;
        let usage = tokio::time::timeout(StdDuration::from_secs(timeout_secs), self.measure(&run, &credential))
            .await
            .map_err(|_| ReconcileError::Timeout(timeout_secs))??;

        match self.store.record_attempt(&run, usage.clone(), now).await {
            Err(DomainError::ConcurrencyConflict { .. }) => {
                debug!(run_id = %run.run_id, "Version conflict, retrying against fresh state");
                let fresh = self.store.require(&run.run_id).await?;
                Ok(self.store.record_attempt(&fresh, usage, now).await?)
            }
            other => Ok(other?),
        }
    }

    /// Query every closed step's window. Any unavailable window fails the
    /// whole measurement so no partial attempt is ever appended.
    async fn measure(&self, run: &Run, credential: &Credential) -> Result<Vec<StepUsage>, ReconcileError> {
        let mut usage = Vec::with_capacity(run.steps.len());
        let mut run_total = AggregateUsage::default();
        for step in run.closed_steps() {
            let Some((start, end)) = step.window() else {
                continue;
            };
            let aggregate = self
                .query_with_backoff(credential, TimeWindow::new(start, end))
                .await
                .map_err(|reason| match reason {
                    UnavailableReason::Unauthorized(message) => ReconcileError::Authorization {
                        credential: credential.name.clone(),
                        message,
                    },
                    other => ReconcileError::Transport(other.to_string()),
                })?;
            run_total
                .add(aggregate.input_units, aggregate.output_units, aggregate.request_count)
                .map_err(|reason| ReconcileError::Transport(reason.to_string()))?;
            debug!(
                run_id = %run.run_id,
                step = step.step_number,
                tokens_in = aggregate.input_units,
                tokens_out = aggregate.output_units,
                "Step measured"
            );
            usage.push(StepUsage {
                step_number: step.step_number,
                tokens_in: aggregate.input_units,
                tokens_out: aggregate.output_units,
                api_calls: aggregate.request_count,
            });
        }
        Ok(usage)
    }

    /// Query one window, backing off only while the API reports throttling.
    async fn query_with_backoff(
        &self,
        credential: &Credential,
        window: TimeWindow,
    ) -> Result<AggregateUsage, UnavailableReason> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(StdDuration::from_millis(self.retry.initial_backoff_ms))
            .with_max_interval(StdDuration::from_millis(self.retry.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build();

        let retries = AtomicU32::new(0);
        let retries = &retries;
        let max_retries = self.retry.max_retries;
        let client = &self.client;
        let filter = self.filter.as_deref();

        retry(policy, move || async move {
            match client.query(credential, window, filter).await {
                AggregateResult::Usage(usage) => Ok(usage),
                AggregateResult::Unavailable(UnavailableReason::RateLimited { retry_after }) => {
                    let reason = UnavailableReason::RateLimited { retry_after };
                    let n = retries.fetch_add(1, Ordering::SeqCst);
                    if n >= max_retries {
                        return Err(backoff::Error::permanent(reason));
                    }
                    debug!(credential = %credential.name, retry = n + 1, "Rate limited, backing off");
                    match retry_after {
                        Some(wait) => Err(backoff::Error::retry_after(reason, wait)),
                        None => Err(backoff::Error::transient(reason)),
                    }
                }
                AggregateResult::Unavailable(other) => Err(backoff::Error::permanent(other)),
            }
        })
        .await
    }
}
