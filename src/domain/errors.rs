//! Domain errors for the usage reconciliation engine.

use thiserror::Error;

/// Domain-level errors raised by the store and the step recorder.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Step {step_number} not found in run {run_id}")]
    StepNotFound { run_id: String, step_number: u32 },

    #[error("Run already exists: {0}")]
    RunAlreadyExists(String),

    #[error("Step {step_number} of run {run_id} is still open")]
    StepStillOpen { run_id: String, step_number: u32 },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Concurrency conflict: run {run_id} was modified (expected version {expected})")]
    ConcurrencyConflict { run_id: String, expected: u64 },
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Per-run reconciliation failures caught at the driver boundary.
///
/// Data anomalies are deliberately absent: a decreasing count is reported
/// through the `warning` verification status, never as an error.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Network or server failure; the next scheduled pass retries.
    #[error("Metering transport error: {0}")]
    Transport(String),

    /// Credential rejected; retrying alone will not help.
    #[error("Metering credential '{credential}' rejected: {message}")]
    Authorization { credential: String, message: String },

    /// Credential is not configured at all.
    #[error("No metering credential configured for '{0}'")]
    MissingCredential(String),

    #[error("Metering query timed out after {0}s")]
    Timeout(u64),

    /// Optimistic concurrency check failed even after one retry.
    #[error("Store write conflict on run {0}")]
    StoreWriteConflict(String),

    #[error("Store error: {0}")]
    Store(#[source] DomainError),
}

impl ReconcileError {
    /// Short machine-readable kind, stored in the failure journal.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Authorization { .. } => "authorization",
            Self::MissingCredential(_) => "missing_credential",
            Self::Timeout(_) => "timeout",
            Self::StoreWriteConflict(_) => "store_write_conflict",
            Self::Store(_) => "store",
        }
    }

    /// Whether this failure should stop every other run sharing the credential.
    pub fn poisons_credential(&self) -> bool {
        matches!(self, Self::Authorization { .. } | Self::MissingCredential(_))
    }
}

impl From<DomainError> for ReconcileError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::ConcurrencyConflict { run_id, .. } => Self::StoreWriteConflict(run_id),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_store_write_conflict() {
        let err: ReconcileError = DomainError::ConcurrencyConflict {
            run_id: "r1".to_string(),
            expected: 3,
        }
        .into();
        assert!(matches!(err, ReconcileError::StoreWriteConflict(ref id) if id == "r1"));
        assert_eq!(err.kind(), "store_write_conflict");
    }

    #[test]
    fn test_only_credential_failures_poison() {
        assert!(ReconcileError::Authorization {
            credential: "default".to_string(),
            message: "401".to_string(),
        }
        .poisons_credential());
        assert!(!ReconcileError::Transport("reset".to_string()).poisons_credential());
        assert!(!ReconcileError::Timeout(30).poisons_credential());
    }
}
