//! Port trait definitions (Hexagonal Architecture)
//!
//! - RunRepository: persistence of runs, steps, and attempt logs
//! - MeteringClient: time-ranged aggregate usage queries

pub mod metering_client;
pub mod run_repository;

pub use metering_client::{
    AggregateResult, AggregateUsage, Credential, MeteringClient, TimeWindow, UnavailableReason,
    MAX_USAGE_COUNT,
};
pub use run_repository::{AttemptCommit, RunFilter, RunRepository};
