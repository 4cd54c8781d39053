pub mod attempt;
pub mod config;
pub mod record;
pub mod run;
pub mod verification;

pub use attempt::{AttemptLog, ReconciliationAttempt, ReconciliationFailure, StepUsage};
pub use config::{
    Config, DatabaseConfig, LoggingConfig, MeteringConfig, RateLimitConfig, ReconciliationConfig,
    RetryConfig,
};
pub use record::{AttemptRecord, RunRecord, StepRecord, UsageReconciliationRecord};
pub use run::{Run, Step, UsageValue, VerificationStatus};
pub use verification::VerificationOutcome;

use chrono::{DateTime, SubsecRound, Utc};

/// Current wall-clock time truncated to whole seconds.
pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
