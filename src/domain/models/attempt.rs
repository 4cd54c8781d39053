//! Reconciliation attempts and the append-only attempt log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Usage fetched for one step's time window during a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUsage {
    pub step_number: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub api_calls: u64,
}

impl StepUsage {
    pub fn has_tokens(&self) -> bool {
        self.tokens_in > 0 || self.tokens_out > 0
    }
}

/// One reconciliation pass's full re-measurement of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAttempt {
    pub attempt_index: u32,
    pub timestamp: DateTime<Utc>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub api_calls: u64,
    pub steps_with_data: u32,
    pub total_steps: u32,
    #[serde(default)]
    pub step_usage: Vec<StepUsage>,
}

impl ReconciliationAttempt {
    /// Build an attempt by summing per-step measurements. Totals saturate
    /// rather than wrap; the store rejects anything it cannot hold.
    pub fn from_step_usage(
        attempt_index: u32,
        timestamp: DateTime<Utc>,
        step_usage: Vec<StepUsage>,
    ) -> Self {
        let total = |field: fn(&StepUsage) -> u64| {
            step_usage.iter().map(field).fold(0u64, u64::saturating_add)
        };
        let tokens_in = total(|s| s.tokens_in);
        let tokens_out = total(|s| s.tokens_out);
        let api_calls = total(|s| s.api_calls);
        let steps_with_data = step_usage.iter().filter(|s| s.has_tokens()).count() as u32;

        Self {
            attempt_index,
            timestamp,
            tokens_in,
            tokens_out,
            api_calls,
            steps_with_data,
            total_steps: step_usage.len() as u32,
            step_usage,
        }
    }

    pub fn is_all_zero(&self) -> bool {
        self.tokens_in == 0 && self.tokens_out == 0 && self.api_calls == 0
    }

    /// The pair compared for stability and anomalies.
    pub fn token_pair(&self) -> (u64, u64) {
        (self.tokens_in, self.tokens_out)
    }

    /// Informational fraction of steps with nonzero tokens.
    pub fn coverage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        f64::from(self.steps_with_data) / f64::from(self.total_steps)
    }
}

/// A pass that could not produce an attempt. Kept for audit only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFailure {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub reason: String,
}

/// Append-only history of attempts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptLog {
    attempts: Vec<ReconciliationAttempt>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted attempts, checking ordering.
    pub fn from_attempts(attempts: Vec<ReconciliationAttempt>) -> DomainResult<Self> {
        let mut log = Self::new();
        for attempt in attempts {
            log.append(attempt)?;
        }
        Ok(log)
    }

    /// Append an attempt; index must be next in sequence and the timestamp
    /// strictly later than the previous attempt.
    pub fn append(&mut self, attempt: ReconciliationAttempt) -> DomainResult<()> {
        let expected_index = self.attempts.len() as u32;
        if attempt.attempt_index != expected_index {
            return Err(DomainError::ValidationFailed(format!(
                "attempt index {} out of sequence (expected {})",
                attempt.attempt_index, expected_index
            )));
        }
        if let Some(last) = self.latest() {
            if attempt.timestamp <= last.timestamp {
                return Err(DomainError::ValidationFailed(format!(
                    "attempt timestamp {} is not after previous attempt {}",
                    attempt.timestamp.to_rfc3339(),
                    last.timestamp.to_rfc3339()
                )));
            }
        }
        self.attempts.push(attempt);
        Ok(())
    }

    /// Index and timestamp the next attempt should use at `now`.
    pub fn next_slot(&self, now: DateTime<Utc>) -> (u32, DateTime<Utc>) {
        let index = self.attempts.len() as u32;
        let timestamp = match self.latest() {
            Some(last) if now <= last.timestamp => last.timestamp + Duration::seconds(1),
            _ => now,
        };
        (index, timestamp)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn latest(&self) -> Option<&ReconciliationAttempt> {
        self.attempts.last()
    }

    /// The two most recent attempts, oldest first.
    pub fn latest_pair(&self) -> Option<(&ReconciliationAttempt, &ReconciliationAttempt)> {
        match self.attempts.as_slice() {
            [.., earlier, later] => Some((earlier, later)),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReconciliationAttempt> {
        self.attempts.iter()
    }

    /// Adjacent pairs, oldest first.
    pub fn pairs(&self) -> impl Iterator<Item = (&ReconciliationAttempt, &ReconciliationAttempt)> {
        self.attempts.windows(2).map(|w| (&w[0], &w[1]))
    }

    pub fn as_slice(&self) -> &[ReconciliationAttempt] {
        &self.attempts
    }
}
