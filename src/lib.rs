//! usage-reconciler - deferred usage metrics reconciliation
//!
//! Executors record run and step boundaries while they work. Token usage from
//! the metering API lags behind, so a later reconciliation pass re-measures
//! each run's step windows, appends an attempt to its history, and derives a
//! verification status from how stable those measurements are over time.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, ports and errors
//! - **Service Layer** (`services`): step recording, verification, reconciliation
//! - **Adapters** (`adapters`): SQLite persistence and metering API clients
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::metering::{HttpMeteringClient, InMemoryMeteringClient};
pub use adapters::sqlite::SqliteRunRepository;
pub use domain::models::{
    AttemptLog, Config, ReconciliationAttempt, Run, RunRecord, Step, StepUsage, UsageValue,
    VerificationOutcome, VerificationStatus,
};
pub use domain::ports::{MeteringClient, RunRepository};
pub use domain::{DomainError, DomainResult, ReconcileError};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CredentialStore, ReconciliationDriver, RunMetricsStore, Selection, StepRecorder,
    VerificationStateMachine,
};
