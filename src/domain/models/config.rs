use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Main configuration structure for the reconciler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Verification thresholds and batch limits
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    /// Metering API endpoint and credentials
    #[serde(default)]
    pub metering: MeteringConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry policy for rate-limited metering queries
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".usage-reconciler/runs.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite:{}", self.path)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation for file output: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Verification thresholds and batch limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReconciliationConfig {
    /// Minimum spacing between attempts counted toward stability (minutes)
    #[serde(default = "default_verification_interval_min")]
    pub verification_interval_min: u64,

    /// Number of trailing identical attempts required for `verified`
    #[serde(default = "default_min_stable_verifications")]
    pub min_stable_verifications: usize,

    /// Runs younger than this are not reconciled (minutes)
    #[serde(default = "default_min_reconciliation_age_min")]
    pub min_reconciliation_age_min: u64,

    /// Runs older than this are no longer reconciled (hours)
    #[serde(default = "default_max_reconciliation_age_hours")]
    pub max_reconciliation_age_hours: u64,

    /// Runs reconciled concurrently in one pass
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Timeout around one run's metering queries (seconds)
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

const fn default_verification_interval_min() -> u64 {
    60
}

const fn default_min_stable_verifications() -> usize {
    2
}

const fn default_min_reconciliation_age_min() -> u64 {
    30
}

const fn default_max_reconciliation_age_hours() -> u64 {
    24
}

const fn default_max_concurrent_runs() -> usize {
    4
}

const fn default_run_timeout_secs() -> u64 {
    120
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            verification_interval_min: default_verification_interval_min(),
            min_stable_verifications: default_min_stable_verifications(),
            min_reconciliation_age_min: default_min_reconciliation_age_min(),
            max_reconciliation_age_hours: default_max_reconciliation_age_hours(),
            max_concurrent_runs: default_max_concurrent_runs(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

impl ReconciliationConfig {
    pub fn verification_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.verification_interval_min as i64)
    }

    pub fn min_age(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.min_reconciliation_age_min as i64)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_reconciliation_age_hours as i64)
    }
}

/// Metering API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MeteringConfig {
    /// Base URL of the usage endpoint
    #[serde(default = "default_metering_base_url")]
    pub base_url: String,

    /// Credential used by runs that do not name one
    #[serde(default = "default_credential_name")]
    pub default_credential: String,

    /// Credential name -> environment variable holding the secret
    #[serde(default = "default_credentials")]
    pub credentials: HashMap<String, String>,

    /// Optional filter passed through to every query
    #[serde(default)]
    pub filter: Option<String>,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Per-request HTTP timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_metering_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_credential_name() -> String {
    "default".to_string()
}

fn default_credentials() -> HashMap<String, String> {
    HashMap::from([(default_credential_name(), "METERING_API_KEY".to_string())])
}

const fn default_page_size() -> u32 {
    100
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            base_url: default_metering_base_url(),
            default_credential: default_credential_name(),
            credentials: default_credentials(),
            filter: None,
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Requests per second allowed
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Burst size for token bucket
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

const fn default_requests_per_second() -> u32 {
    2
}

const fn default_burst_size() -> u32 {
    5
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts after a rate-limit response
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    1000
}

const fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}
