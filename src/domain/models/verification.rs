use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::run::VerificationStatus;

/// Result of evaluating a run's attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub status: VerificationStatus,
    /// Human-readable explanation persisted alongside the status.
    pub message: String,
    /// Trailing attempts that agree and are spaced far enough apart.
    pub stable_count: usize,
    pub required_stable: usize,
    /// Earliest time another attempt could extend the stable window.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Anomalous adjacent pairs anywhere in the history.
    pub historical_anomalies: usize,
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}
