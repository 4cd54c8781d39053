use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Project-local configuration directory.
pub const CONFIG_DIR: &str = ".usage-reconciler";

/// Prefix for environment overrides; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "USAGE_RECONCILER_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid min_stable_verifications: {0}. Must be at least 1")]
    InvalidStableVerifications(usize),

    #[error("Invalid verification_interval_min: {0}. Must be at least 1")]
    InvalidVerificationInterval(u64),

    #[error(
        "Invalid age window: min_reconciliation_age_min ({0} min) exceeds max_reconciliation_age_hours ({1} h)"
    )]
    InvalidAgeWindow(u64, u64),

    #[error("Invalid rate limit: {0}. Must be positive")]
    InvalidRateLimit(u32),

    #[error("Invalid burst_size: {0}. Must be at least 1")]
    InvalidBurstSize(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid metering base_url: {0}. Must start with http:// or https://")]
    InvalidBaseUrl(String),

    #[error("Default credential '{0}' has no entry in metering.credentials")]
    UnknownDefaultCredential(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .usage-reconciler/config.yaml (project config, created by init)
    /// 3. .usage-reconciler/local.yaml (local overrides, optional)
    /// 4. `explicit`, when given on the command line
    /// 5. Environment variables (USAGE_RECONCILER_* prefix)
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
        }

        let config: Config = Self::figment(Path::new(CONFIG_DIR), explicit)
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, without project files or env.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(project_dir: &Path, explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(project_dir.join("config.yaml")))
            .merge(Yaml::file(project_dir.join("local.yaml")));
        if let Some(path) = explicit {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        let rec = &config.reconciliation;
        if rec.min_stable_verifications == 0 {
            return Err(ConfigError::InvalidStableVerifications(rec.min_stable_verifications));
        }
        if rec.verification_interval_min == 0 {
            return Err(ConfigError::InvalidVerificationInterval(rec.verification_interval_min));
        }
        if rec.min_age() > rec.max_age() {
            return Err(ConfigError::InvalidAgeWindow(
                rec.min_reconciliation_age_min,
                rec.max_reconciliation_age_hours,
            ));
        }
        if rec.max_concurrent_runs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if rec.run_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "run_timeout_secs must be at least 1".to_string(),
            ));
        }

        let metering = &config.metering;
        if !(metering.base_url.starts_with("http://") || metering.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(metering.base_url.clone()));
        }
        if !metering.credentials.contains_key(&metering.default_credential) {
            return Err(ConfigError::UnknownDefaultCredential(metering.default_credential.clone()));
        }
        if let Some((name, _)) = metering.credentials.iter().find(|(_, var)| var.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(format!(
                "credential '{name}' has an empty environment variable name"
            )));
        }
        if metering.page_size == 0 {
            return Err(ConfigError::ValidationFailed("page_size must be at least 1".to_string()));
        }

        if config.rate_limit.requests_per_second == 0 {
            return Err(ConfigError::InvalidRateLimit(config.rate_limit.requests_per_second));
        }
        if config.rate_limit.burst_size == 0 {
            return Err(ConfigError::InvalidBurstSize(config.rate_limit.burst_size));
        }

        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        Ok(())
    }

    /// Settings that are valid but risky. Returned rather than logged
    /// because configuration is loaded before the logger exists.
    pub fn warnings(config: &Config) -> Vec<String> {
        let mut warnings = Vec::new();
        if config.reconciliation.min_stable_verifications == 1 {
            warnings.push(
                "min_stable_verifications = 1: a single measurement will be reported as verified \
                 without any confirming re-measurement"
                    .to_string(),
            );
        }
        if config.retry.max_retries == 0 {
            warnings.push("retry.max_retries = 0: rate-limited queries fail immediately".to_string());
        }
        warnings
    }

    /// Default configuration as YAML, written by `init`.
    pub fn default_yaml() -> Result<String> {
        serde_yaml::to_string(&Config::default()).context("Failed to serialize default config")
    }
}
