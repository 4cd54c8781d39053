//! Reset a run's reconciliation state.

use anyhow::Result;
use clap::Args;

use crate::cli::commands::open_store;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Run to reset
    pub run_id: String,
}

#[derive(Debug, serde::Serialize)]
pub struct ResetOutput {
    pub success: bool,
    pub run_id: String,
    pub attempts_cleared: usize,
    pub message: String,
}

impl CommandOutput for ResetOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: ResetArgs, config: &Config, json_mode: bool) -> Result<()> {
    let store = open_store(config).await?;
    store.require(&args.run_id).await?;
    let attempts_cleared = store.attempts(&args.run_id).await?.len();
    store.reset(&args.run_id).await?;

    output(
        &ResetOutput {
            success: true,
            message: format!(
                "Run {} reset to pending ({} attempt(s) cleared)",
                args.run_id, attempts_cleared
            ),
            run_id: args.run_id,
            attempts_cleared,
        },
        json_mode,
    );
    Ok(())
}
