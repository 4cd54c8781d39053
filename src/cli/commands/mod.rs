//! CLI command implementations.

pub mod init;
pub mod reconcile;
pub mod reset;
pub mod run;
pub mod show;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::adapters::sqlite::{initialize_database, SqliteRunRepository};
use crate::domain::models::Config;
use crate::services::{RunMetricsStore, VerificationStateMachine};

/// Open the configured database and wrap it in a metrics store.
pub(crate) async fn open_store(config: &Config) -> Result<Arc<RunMetricsStore<SqliteRunRepository>>> {
    let pool = initialize_database(&config.database)
        .await
        .with_context(|| {
            format!(
                "Failed to open database at {}. Run 'usage-reconciler init' first.",
                config.database.path
            )
        })?;
    let repo = Arc::new(SqliteRunRepository::new(pool));
    let machine = VerificationStateMachine::from_config(&config.reconciliation);
    Ok(Arc::new(RunMetricsStore::new(repo, machine)))
}
