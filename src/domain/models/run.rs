//! Run and step domain models.
//!
//! A run is one execution of a multi-step workflow. Each step records the
//! wall-clock window it occupied; usage for that window is filled in later by
//! reconciliation against the metering API.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verification state of a run (or of a single step, for coverage bookkeeping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Latest measurement is all-zero and the run is too young to trust it.
    DataNotAvailable,
    /// Still waiting for counts to stabilize.
    Pending,
    /// A later measurement reported fewer tokens than an earlier one.
    Warning,
    /// Trailing measurements agree and are sufficiently spaced.
    Verified,
}

impl Default for VerificationStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataNotAvailable => "data_not_available",
            Self::Pending => "pending",
            Self::Warning => "warning",
            Self::Verified => "verified",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "data_not_available" => Some(Self::DataNotAvailable),
            "pending" => Some(Self::Pending),
            "warning" => Some(Self::Warning),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A usage counter that distinguishes "never measured" from a measured zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum UsageValue {
    #[default]
    Unknown,
    Measured(u64),
}

impl UsageValue {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Measured(_))
    }

    pub fn measured(&self) -> Option<u64> {
        match self {
            Self::Unknown => None,
            Self::Measured(v) => Some(*v),
        }
    }
}

impl From<Option<u64>> for UsageValue {
    fn from(v: Option<u64>) -> Self {
        v.map_or(Self::Unknown, Self::Measured)
    }
}

impl From<UsageValue> for Option<u64> {
    fn from(v: UsageValue) -> Self {
        v.measured()
    }
}

impl std::fmt::Display for UsageValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => f.write_str("?"),
            Self::Measured(v) => write!(f, "{v}"),
        }
    }
}

/// One step of a run and the time window its usage is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub step_number: u32,
    pub start_ts: DateTime<Utc>,
    /// `None` while the step is still executing.
    pub end_ts: Option<DateTime<Utc>>,
    pub tokens_in: UsageValue,
    pub tokens_out: UsageValue,
    pub api_calls: UsageValue,
    pub verification_status: VerificationStatus,
}

impl Step {
    /// A freshly started step: unknown usage, pending verification.
    pub fn started(step_number: u32, start_ts: DateTime<Utc>) -> Self {
        Self {
            step_number,
            start_ts,
            end_ts: None,
            tokens_in: UsageValue::Unknown,
            tokens_out: UsageValue::Unknown,
            api_calls: UsageValue::Unknown,
            verification_status: VerificationStatus::Pending,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_ts.is_none()
    }

    /// Half-open `[start, end)` window, if the step has finished.
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.end_ts.map(|end| (self.start_ts, end))
    }

    /// Whether the latest measurement attributed any tokens to this step.
    pub fn has_data(&self) -> bool {
        self.tokens_in.measured().is_some_and(|v| v > 0) || self.tokens_out.measured().is_some_and(|v| v > 0)
    }
}

/// A run of a multi-step workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub framework_id: String,
    /// Name of the metering credential the run's steps were billed to.
    pub credential: String,
    pub steps: Vec<Step>,
    /// Cached result of the last evaluation; display only.
    pub verification_status: VerificationStatus,
    pub verification_message: Option<String>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every reconciliation write.
    pub version: u64,
}

impl Run {
    pub fn new(framework_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), framework_id, credential)
    }

    pub fn with_id(
        run_id: impl Into<String>,
        framework_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            framework_id: framework_id.into(),
            credential: credential.into(),
            steps: Vec::new(),
            verification_status: VerificationStatus::Pending,
            verification_message: None,
            last_reconciled_at: None,
            created_at: super::now_seconds(),
            version: 0,
        }
    }

    pub fn step(&self, step_number: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    pub fn open_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.is_open())
    }

    /// End of the run: the latest step end, once every step has finished.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        if self.steps.is_empty() || self.steps.iter().any(Step::is_open) {
            return None;
        }
        self.steps.iter().filter_map(|s| s.end_ts).max()
    }

    /// Age measured from the end of the run, falling back to creation time.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.ended_at().unwrap_or(self.created_at)
    }

    /// Steps with a closed window, in step order.
    pub fn closed_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.steps.iter().filter(|s| !s.is_open()).collect();
        steps.sort_by_key(|s| s.step_number);
        steps
    }

    pub fn steps_with_data(&self) -> usize {
        self.steps.iter().filter(|s| s.has_data()).count()
    }
}
