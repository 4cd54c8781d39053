//! SQLite adapters for the run metrics store.

pub mod connection;
pub mod migrations;
pub mod run_repository;

pub use connection::{create_pool, create_test_pool, ConnectionError, PoolConfig};
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use run_repository::SqliteRunRepository;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::DatabaseConfig;

/// Parse an RFC3339 datetime string from a SQLite row field.
pub fn parse_datetime(s: &str) -> DomainResult<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map_err(|e| DomainError::SerializationError(e.to_string()))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an optional RFC3339 datetime string from a SQLite row field.
pub fn parse_optional_datetime(s: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_datetime(&s)).transpose()
}

/// Convert a nullable counter column into an optional unsigned value.
pub fn parse_optional_count(v: Option<i64>) -> DomainResult<Option<u64>> {
    v.map(|n| {
        u64::try_from(n).map_err(|_| DomainError::SerializationError(format!("negative counter {n}")))
    })
    .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Open the configured database file and bring its schema up to date.
pub async fn initialize_database(config: &DatabaseConfig) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(&config.url(), Some(PoolConfig::from(config))).await?;
    migrate(pool).await
}

/// In-memory pool with the full schema, for tests.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    migrate(create_test_pool().await?).await
}

async fn migrate(pool: SqlitePool) -> Result<SqlitePool, DatabaseError> {
    let applied = Migrator::new(pool.clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await?;
    tracing::debug!(applied, "Schema migrations checked");
    Ok(pool)
}
