//! Command-line interface.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

use commands::{init::InitArgs, reconcile::ReconcileArgs, reset::ResetArgs, run::RunArgs, show::ShowArgs};

#[derive(Parser, Debug)]
#[command(name = "usage-reconciler")]
#[command(about = "Reconcile deferred usage metrics against the metering API", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Additional config file, applied over the project config
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default config and create the database
    Init(InitArgs),
    /// Re-measure eligible runs and update their verification status
    Reconcile(ReconcileArgs),
    /// Record run and step boundaries
    Run(RunArgs),
    /// Show a run's steps, attempt history and anomalies
    Show(ShowArgs),
    /// Clear a run's attempt history and return it to pending
    Reset(ResetArgs),
}

/// Report a command failure on the channel matching the output mode.
pub fn handle_error(err: &anyhow::Error, json_mode: bool) {
    if json_mode {
        let body = serde_json::json!({
            "success": false,
            "error": format!("{err:#}"),
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("{} {:#}", style("Error:").red().bold(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_reconcile_flags() {
        let cli = Cli::try_parse_from([
            "usage-reconciler",
            "--json",
            "reconcile",
            "run-42",
            "--list",
            "--verbose",
            "--force",
            "--min-age",
            "10",
            "--max-age",
            "48",
            "--framework",
            "langgraph",
        ])
        .unwrap();

        assert!(cli.json);
        let Commands::Reconcile(args) = cli.command else {
            panic!("expected reconcile");
        };
        assert_eq!(args.selector.as_deref(), Some("run-42"));
        assert!(args.list && args.verbose && args.force);
        assert_eq!(args.min_age, Some(10));
        assert_eq!(args.max_age, Some(48));
        assert_eq!(args.framework.as_deref(), Some("langgraph"));
    }

    #[test]
    fn test_parse_step_commands() {
        let cli = Cli::try_parse_from(["usage-reconciler", "run", "begin-step", "r1", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run(RunArgs {
                command: commands::run::RunCommands::BeginStep { ref run_id, step_number: 3 }
            }) if run_id == "r1"
        ));

        let cli = Cli::try_parse_from([
            "usage-reconciler",
            "--config",
            "ci.yaml",
            "run",
            "start",
            "--framework",
            "crewai",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("ci.yaml")));
    }

    #[test]
    fn test_reconcile_rejects_negative_age() {
        assert!(Cli::try_parse_from(["usage-reconciler", "reconcile", "--min-age", "-5"]).is_err());
    }
}
