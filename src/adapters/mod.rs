//! Infrastructure adapters for external systems.

pub mod metering;
pub mod sqlite;
