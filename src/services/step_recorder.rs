//! Step boundary recorder.
//!
//! Records the wall-clock window each step of a run occupied. Windows are
//! second-resolution, non-empty, and never overlap between consecutive steps,
//! so usage attributed to one step is never counted against another.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{now_seconds, Run, Step};
use crate::domain::ports::RunRepository;

pub struct StepRecorder<R: RunRepository> {
    repo: Arc<R>,
}

impl<R: RunRepository> StepRecorder<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Create the run record a step sequence belongs to.
    pub async fn start_run(
        &self,
        framework_id: &str,
        credential: &str,
        run_id: Option<String>,
    ) -> DomainResult<Run> {
        if framework_id.trim().is_empty() {
            return Err(DomainError::ValidationFailed("framework id cannot be empty".to_string()));
        }
        let run = match run_id {
            Some(id) => Run::with_id(id, framework_id, credential),
            None => Run::new(framework_id, credential),
        };
        self.repo.create_run(&run).await?;
        info!(run_id = %run.run_id, framework = %run.framework_id, "Run started");
        Ok(run)
    }

    pub async fn begin_step(&self, run_id: &str, step_number: u32) -> DomainResult<DateTime<Utc>> {
        self.begin_step_at(run_id, step_number, now_seconds()).await
    }

    /// Open a step at `now`, clamped so it starts no earlier than the
    /// previous step ended.
    pub async fn begin_step_at(
        &self,
        run_id: &str,
        step_number: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<DateTime<Utc>> {
        let run = self.load(run_id).await?;

        if let Some(open) = run.open_step() {
            return Err(DomainError::StepStillOpen {
                run_id: run_id.to_string(),
                step_number: open.step_number,
            });
        }
        if run.step(step_number).is_some() {
            return Err(DomainError::ValidationFailed(format!(
                "step {step_number} of run {run_id} was already recorded"
            )));
        }

        let previous_end = run.steps.iter().filter_map(|s| s.end_ts).max();
        let start_ts = match previous_end {
            Some(end) if now < end => end,
            _ => now,
        };

        self.repo.insert_step(run_id, &Step::started(step_number, start_ts)).await?;
        debug!(run_id, step = step_number, start = %start_ts.to_rfc3339(), "Step began");
        Ok(start_ts)
    }

    pub async fn end_step(&self, run_id: &str, step_number: u32) -> DomainResult<DateTime<Utc>> {
        self.end_step_at(run_id, step_number, now_seconds()).await
    }

    /// Close a step at `now`, clamped so the window is at least one second.
    pub async fn end_step_at(
        &self,
        run_id: &str,
        step_number: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<DateTime<Utc>> {
        let run = self.load(run_id).await?;
        let step = run.step(step_number).ok_or_else(|| DomainError::StepNotFound {
            run_id: run_id.to_string(),
            step_number,
        })?;
        if !step.is_open() {
            return Err(DomainError::ValidationFailed(format!(
                "step {step_number} of run {run_id} has already ended"
            )));
        }

        let min_end = step.start_ts + Duration::seconds(1);
        let end_ts = now.max(min_end);

        self.repo.close_step(run_id, step_number, end_ts).await?;
        debug!(run_id, step = step_number, end = %end_ts.to_rfc3339(), "Step ended");
        Ok(end_ts)
    }

    async fn load(&self, run_id: &str) -> DomainResult<Run> {
        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| DomainError::RunNotFound(run_id.to_string()))
    }
}
