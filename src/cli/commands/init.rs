//! Implementation of the `usage-reconciler init` command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::adapters::sqlite::initialize_database;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, DatabaseConfig};
use crate::infrastructure::config::{ConfigLoader, CONFIG_DIR};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long, short)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub message: String,
    pub config_path: PathBuf,
    pub config_written: bool,
    pub database_path: PathBuf,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        if self.config_written {
            lines.push(format!("\nWrote default config to {}", self.config_path.display()));
        }
        lines.push(format!("Database ready at {}", self.database_path.display()));
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn resolve_target(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path))
    }
}

pub async fn execute(args: InitArgs, config: &Config, json_mode: bool) -> Result<()> {
    let target = resolve_target(&args.path)?;
    let config_dir = target.join(CONFIG_DIR);
    let config_path = config_dir.join("config.yaml");

    fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let config_written = if config_path.exists() && !args.force {
        false
    } else {
        fs::write(&config_path, ConfigLoader::default_yaml()?)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        true
    };

    let database_path = {
        let configured = Path::new(&config.database.path);
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            target.join(configured)
        }
    };
    let database = DatabaseConfig {
        path: database_path.display().to_string(),
        ..config.database.clone()
    };
    initialize_database(&database)
        .await
        .context("Failed to initialize database")?;

    let message = if config_written {
        "Initialized usage-reconciler project".to_string()
    } else {
        "Config already present, left untouched (use --force to overwrite)".to_string()
    };

    output(
        &InitOutput {
            success: true,
            message,
            config_path,
            config_written,
            database_path,
        },
        json_mode,
    );
    Ok(())
}
