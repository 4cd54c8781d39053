//! Domain layer for the usage reconciliation engine
//!
//! Models, port traits, and errors. Nothing in here performs I/O.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, ReconcileError};
