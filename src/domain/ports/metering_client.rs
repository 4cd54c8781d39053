//! Port for the external metering API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A named metering credential. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct Credential {
    pub name: String,
    secret: String,
}

impl Credential {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Half-open `[start, end)` query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Usage summed over every bucket and record returned for a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateUsage {
    pub input_units: u64,
    pub output_units: u64,
    pub request_count: u64,
}

/// Largest counter value the store can persist (SQLite INTEGER is signed).
pub const MAX_USAGE_COUNT: u64 = i64::MAX as u64;

impl AggregateUsage {
    /// Add one record. Fails with `Malformed` when any counter would pass
    /// [`MAX_USAGE_COUNT`]; the totals are left unchanged in that case.
    pub fn add(&mut self, input_units: u64, output_units: u64, request_count: u64) -> Result<(), UnavailableReason> {
        let sum = |total: u64, more: u64| total.checked_add(more).filter(|v| *v <= MAX_USAGE_COUNT);
        match (
            sum(self.input_units, input_units),
            sum(self.output_units, output_units),
            sum(self.request_count, request_count),
        ) {
            (Some(input_units), Some(output_units), Some(request_count)) => {
                *self = Self { input_units, output_units, request_count };
                Ok(())
            }
            _ => Err(UnavailableReason::Malformed(format!(
                "usage counter exceeds {MAX_USAGE_COUNT} (in={input_units}, out={output_units}, requests={request_count})"
            ))),
        }
    }
}

/// Why a query produced no usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    Transport(String),
    Unauthorized(String),
    RateLimited { retry_after: Option<Duration> },
    Malformed(String),
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport failure: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::RateLimited { retry_after: Some(d) } => {
                write!(f, "rate limited (retry after {}s)", d.as_secs())
            }
            Self::RateLimited { retry_after: None } => f.write_str("rate limited"),
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

/// Outcome of one metering query. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateResult {
    Usage(AggregateUsage),
    Unavailable(UnavailableReason),
}

#[async_trait]
pub trait MeteringClient: Send + Sync {
    /// Aggregate usage billed to `credential` within `window`.
    ///
    /// Follows pagination to the end but never retries.
    async fn query(
        &self,
        credential: &Credential,
        window: TimeWindow,
        filter: Option<&str>,
    ) -> AggregateResult;
}
