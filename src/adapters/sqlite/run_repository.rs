//! SQLite adapter for RunRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::adapters::sqlite::{parse_datetime, parse_optional_count, parse_optional_datetime};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AttemptLog, ReconciliationAttempt, ReconciliationFailure, Run, Step, StepUsage, UsageValue,
    VerificationStatus,
};
use crate::domain::ports::{AttemptCommit, RunFilter, RunRepository};

#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, run_id: &str) -> DomainResult<Vec<Step>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT step_number, start_ts, end_ts, tokens_in, tokens_out, api_calls, verification_status
             FROM steps WHERE run_id = ? ORDER BY step_number ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Step::try_from).collect()
    }

    async fn hydrate(&self, row: RunRow) -> DomainResult<Run> {
        let steps = self.load_steps(&row.run_id).await?;
        let mut run = Run::try_from(row)?;
        run.steps = steps;
        Ok(run)
    }

    async fn run_exists(&self, run_id: &str) -> DomainResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    framework_id: String,
    credential: String,
    verification_status: String,
    verification_message: Option<String>,
    last_reconciled_at: Option<String>,
    created_at: String,
    version: i64,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    step_number: i64,
    start_ts: String,
    end_ts: Option<String>,
    tokens_in: Option<i64>,
    tokens_out: Option<i64>,
    api_calls: Option<i64>,
    verification_status: String,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    attempt_index: i64,
    timestamp: String,
    tokens_in: i64,
    tokens_out: i64,
    api_calls: i64,
    steps_with_data: i64,
    total_steps: i64,
    step_usage: String,
}

#[derive(sqlx::FromRow)]
struct FailureRow {
    timestamp: String,
    kind: String,
    reason: String,
}

fn parse_status(s: &str) -> DomainResult<VerificationStatus> {
    VerificationStatus::from_str(s)
        .ok_or_else(|| DomainError::SerializationError(format!("unknown verification status: {s}")))
}

/// Counters are stored as signed INTEGER; refuse anything that would not read back.
fn counter_column(field: &str, value: u64) -> DomainResult<i64> {
    i64::try_from(value)
        .map_err(|_| DomainError::ValidationFailed(format!("{field} {value} exceeds the storable range")))
}

fn usage_column(field: &str, value: UsageValue) -> DomainResult<Option<i64>> {
    value.measured().map(|v| counter_column(field, v)).transpose()
}

fn count_column(v: i64) -> DomainResult<u64> {
    u64::try_from(v).map_err(|_| DomainError::SerializationError(format!("negative counter {v}")))
}

struct StepColumns {
    tokens_in: Option<i64>,
    tokens_out: Option<i64>,
    api_calls: Option<i64>,
}

impl StepColumns {
    fn of(step: &Step) -> DomainResult<Self> {
        Ok(Self {
            tokens_in: usage_column("tokens_in", step.tokens_in)?,
            tokens_out: usage_column("tokens_out", step.tokens_out)?,
            api_calls: usage_column("api_calls", step.api_calls)?,
        })
    }
}

impl TryFrom<RunRow> for Run {
    type Error = DomainError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            verification_status: parse_status(&row.verification_status)?,
            last_reconciled_at: parse_optional_datetime(row.last_reconciled_at)?,
            created_at: parse_datetime(&row.created_at)?,
            version: row.version as u64,
            run_id: row.run_id,
            framework_id: row.framework_id,
            credential: row.credential,
            verification_message: row.verification_message,
            steps: Vec::new(),
        })
    }
}

impl TryFrom<StepRow> for Step {
    type Error = DomainError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            step_number: row.step_number as u32,
            start_ts: parse_datetime(&row.start_ts)?,
            end_ts: parse_optional_datetime(row.end_ts)?,
            tokens_in: parse_optional_count(row.tokens_in)?.into(),
            tokens_out: parse_optional_count(row.tokens_out)?.into(),
            api_calls: parse_optional_count(row.api_calls)?.into(),
            verification_status: parse_status(&row.verification_status)?,
        })
    }
}

impl TryFrom<AttemptRow> for ReconciliationAttempt {
    type Error = DomainError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let step_usage: Vec<StepUsage> = serde_json::from_str(&row.step_usage)?;
        Ok(ReconciliationAttempt {
            attempt_index: row.attempt_index as u32,
            timestamp: parse_datetime(&row.timestamp)?,
            tokens_in: count_column(row.tokens_in)?,
            tokens_out: count_column(row.tokens_out)?,
            api_calls: count_column(row.api_calls)?,
            steps_with_data: row.steps_with_data as u32,
            total_steps: row.total_steps as u32,
            step_usage,
        })
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &Run) -> DomainResult<()> {
        if self.run_exists(&run.run_id).await? {
            return Err(DomainError::RunAlreadyExists(run.run_id.clone()));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO runs
             (run_id, framework_id, credential, verification_status, verification_message,
              last_reconciled_at, created_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&run.run_id)
        .bind(&run.framework_id)
        .bind(&run.credential)
        .bind(run.verification_status.as_str())
        .bind(&run.verification_message)
        .bind(run.last_reconciled_at.map(|t| t.to_rfc3339()))
        .bind(run.created_at.to_rfc3339())
        .bind(run.version as i64)
        .execute(&mut *tx)
        .await?;

        for step in &run.steps {
            insert_step_row(&mut tx, &run.run_id, step).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> DomainResult<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, filter: RunFilter) -> DomainResult<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM runs
             WHERE (?1 IS NULL OR run_id = ?1) AND (?2 IS NULL OR framework_id = ?2)
             ORDER BY created_at ASC, run_id ASC",
        )
        .bind(&filter.run_id)
        .bind(&filter.framework_id)
        .fetch_all(&self.pool)
        .await?;

        // One unreadable run must not hide the rest from a batch.
        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let run_id = row.run_id.clone();
            match self.hydrate(row).await {
                Ok(run) => runs.push(run),
                Err(err @ DomainError::SerializationError(_)) => {
                    warn!(run_id = %run_id, error = %err, "Skipping unreadable run");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(runs)
    }

    async fn insert_step(&self, run_id: &str, step: &Step) -> DomainResult<()> {
        if !self.run_exists(run_id).await? {
            return Err(DomainError::RunNotFound(run_id.to_string()));
        }
        let mut tx = self.pool.begin().await?;
        insert_step_row(&mut tx, run_id, step).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close_step(&self, run_id: &str, step_number: u32, end_ts: DateTime<Utc>) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE steps SET end_ts = ? WHERE run_id = ? AND step_number = ? AND end_ts IS NULL",
        )
        .bind(end_ts.to_rfc3339())
        .bind(run_id)
        .bind(i64::from(step_number))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::StepNotFound {
                run_id: run_id.to_string(),
                step_number,
            });
        }
        Ok(())
    }

    async fn load_attempts(&self, run_id: &str) -> DomainResult<AttemptLog> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT attempt_index, timestamp, tokens_in, tokens_out, api_calls,
                    steps_with_data, total_steps, step_usage
             FROM reconciliation_attempts WHERE run_id = ? ORDER BY attempt_index ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let attempts = rows
            .into_iter()
            .map(ReconciliationAttempt::try_from)
            .collect::<DomainResult<Vec<_>>>()?;
        AttemptLog::from_attempts(attempts)
    }

    async fn load_failures(&self, run_id: &str) -> DomainResult<Vec<ReconciliationFailure>> {
        let rows: Vec<FailureRow> = sqlx::query_as(
            "SELECT timestamp, kind, reason FROM reconciliation_failures
             WHERE run_id = ? ORDER BY id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ReconciliationFailure {
                    timestamp: parse_datetime(&row.timestamp)?,
                    kind: row.kind,
                    reason: row.reason,
                })
            })
            .collect()
    }

    async fn commit_attempt(&self, commit: AttemptCommit<'_>) -> DomainResult<u64> {
        let attempt = commit.attempt;
        let step_usage = serde_json::to_string(&attempt.step_usage)?;
        let totals = (
            counter_column("tokens_in", attempt.tokens_in)?,
            counter_column("tokens_out", attempt.tokens_out)?,
            counter_column("api_calls", attempt.api_calls)?,
        );
        let step_columns = commit
            .steps
            .iter()
            .map(|step| StepColumns::of(step).map(|c| (step, c)))
            .collect::<DomainResult<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;

        // The version guard makes the whole read-modify-write conditional.
        let claimed = sqlx::query(
            "UPDATE runs SET verification_status = ?, verification_message = ?,
                    last_reconciled_at = ?, version = version + 1
             WHERE run_id = ? AND version = ?",
        )
        .bind(commit.outcome.status.as_str())
        .bind(&commit.outcome.message)
        .bind(attempt.timestamp.to_rfc3339())
        .bind(commit.run_id)
        .bind(commit.expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            if self.run_exists(commit.run_id).await? {
                return Err(DomainError::ConcurrencyConflict {
                    run_id: commit.run_id.to_string(),
                    expected: commit.expected_version,
                });
            }
            return Err(DomainError::RunNotFound(commit.run_id.to_string()));
        }

        sqlx::query(
            "INSERT INTO reconciliation_attempts
             (run_id, attempt_index, timestamp, tokens_in, tokens_out, api_calls,
              steps_with_data, total_steps, step_usage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(commit.run_id)
        .bind(i64::from(attempt.attempt_index))
        .bind(attempt.timestamp.to_rfc3339())
        .bind(totals.0)
        .bind(totals.1)
        .bind(totals.2)
        .bind(i64::from(attempt.steps_with_data))
        .bind(i64::from(attempt.total_steps))
        .bind(&step_usage)
        .execute(&mut *tx)
        .await?;

        for (step, columns) in step_columns {
            sqlx::query(
                "UPDATE steps SET tokens_in = ?, tokens_out = ?, api_calls = ?, verification_status = ?
                 WHERE run_id = ? AND step_number = ?",
            )
            .bind(columns.tokens_in)
            .bind(columns.tokens_out)
            .bind(columns.api_calls)
            .bind(step.verification_status.as_str())
            .bind(commit.run_id)
            .bind(i64::from(step.step_number))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(commit.expected_version + 1)
    }

    async fn record_failure(&self, run_id: &str, failure: &ReconciliationFailure) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO reconciliation_failures (run_id, timestamp, kind, reason) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(failure.timestamp.to_rfc3339())
        .bind(&failure.kind)
        .bind(&failure.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_run(&self, run_id: &str) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE runs SET verification_status = 'pending', verification_message = NULL,
                    last_reconciled_at = NULL, version = version + 1
             WHERE run_id = ?",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DomainError::RunNotFound(run_id.to_string()));
        }

        sqlx::query("DELETE FROM reconciliation_attempts WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE steps SET tokens_in = NULL, tokens_out = NULL, api_calls = NULL,
                    verification_status = 'pending'
             WHERE run_id = ?",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_step_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: &str,
    step: &Step,
) -> DomainResult<()> {
    let columns = StepColumns::of(step)?;
    sqlx::query(
        "INSERT INTO steps
         (run_id, step_number, start_ts, end_ts, tokens_in, tokens_out, api_calls, verification_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(run_id)
    .bind(i64::from(step.step_number))
    .bind(step.start_ts.to_rfc3339())
    .bind(step.end_ts.map(|t| t.to_rfc3339()))
    .bind(columns.tokens_in)
    .bind(columns.tokens_out)
    .bind(columns.api_calls)
    .bind(step.verification_status.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
