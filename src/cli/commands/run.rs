//! Run and step boundary CLI commands, for executors that shell out.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};

use crate::adapters::sqlite::{initialize_database, SqliteRunRepository};
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::services::StepRecorder;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(subcommand)]
    pub command: RunCommands,
}

#[derive(Subcommand, Debug)]
pub enum RunCommands {
    /// Create a run record
    Start {
        /// Framework the run executes
        #[arg(long)]
        framework: String,
        /// Metering credential name (defaults to metering.default_credential)
        #[arg(long)]
        credential: Option<String>,
        /// Use this id instead of generating one
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Mark the start of a step
    BeginStep {
        run_id: String,
        step_number: u32,
    },
    /// Mark the end of a step
    EndStep {
        run_id: String,
        step_number: u32,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct RunStartOutput {
    pub run_id: String,
    pub framework_id: String,
    pub credential: String,
}

impl CommandOutput for RunStartOutput {
    fn to_human(&self) -> String {
        self.run_id.clone()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct StepBoundaryOutput {
    pub run_id: String,
    pub step_number: u32,
    pub boundary: &'static str,
    /// Unix seconds.
    pub timestamp: i64,
}

impl StepBoundaryOutput {
    fn new(run_id: String, step_number: u32, boundary: &'static str, at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            step_number,
            boundary,
            timestamp: at.timestamp(),
        }
    }
}

impl CommandOutput for StepBoundaryOutput {
    fn to_human(&self) -> String {
        format!(
            "Step {} of {} {} at {}",
            self.step_number,
            self.run_id,
            self.boundary,
            self.timestamp
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: RunArgs, config: &Config, json_mode: bool) -> Result<()> {
    let pool = initialize_database(&config.database).await?;
    let recorder = StepRecorder::new(std::sync::Arc::new(SqliteRunRepository::new(pool)));

    match args.command {
        RunCommands::Start { framework, credential, run_id } => {
            let credential = credential.unwrap_or_else(|| config.metering.default_credential.clone());
            if !config.metering.credentials.contains_key(&credential) {
                anyhow::bail!("Unknown metering credential '{credential}'; add it under metering.credentials");
            }
            let run = recorder.start_run(&framework, &credential, run_id).await?;
            output(
                &RunStartOutput {
                    run_id: run.run_id,
                    framework_id: run.framework_id,
                    credential: run.credential,
                },
                json_mode,
            );
        }
        RunCommands::BeginStep { run_id, step_number } => {
            let at = recorder.begin_step(&run_id, step_number).await?;
            output(&StepBoundaryOutput::new(run_id, step_number, "began", at), json_mode);
        }
        RunCommands::EndStep { run_id, step_number } => {
            let at = recorder.end_step(&run_id, step_number).await?;
            output(&StepBoundaryOutput::new(run_id, step_number, "ended", at), json_mode);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.database.path = dir.path().join("runs.db").display().to_string();
        config
    }

    #[tokio::test]
    async fn test_start_and_steps_through_cli() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let start = RunArgs {
            command: RunCommands::Start {
                framework: "crewai".to_string(),
                credential: None,
                run_id: Some("cli-run".to_string()),
            },
        };
        execute(start, &config, true).await.unwrap();

        for command in [
            RunCommands::BeginStep { run_id: "cli-run".to_string(), step_number: 1 },
            RunCommands::EndStep { run_id: "cli-run".to_string(), step_number: 1 },
        ] {
            execute(RunArgs { command }, &config, true).await.unwrap();
        }

        let pool = initialize_database(&config.database).await.unwrap();
        let repo = SqliteRunRepository::new(pool);
        let run = crate::domain::ports::RunRepository::get_run(&repo, "cli-run")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.credential, "default");
        assert!(run.ended_at().is_some());
    }

    #[tokio::test]
    async fn test_unknown_credential_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let start = RunArgs {
            command: RunCommands::Start {
                framework: "crewai".to_string(),
                credential: Some("nope".to_string()),
                run_id: None,
            },
        };
        assert!(execute(start, &config_in(&dir), true).await.is_err());
    }
}
