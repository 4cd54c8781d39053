pub mod anomaly;
pub mod metrics_store;
pub mod reconciliation_driver;
pub mod stability;
pub mod step_recorder;
pub mod verification;

pub use anomaly::{AnomalyReport, LocatedAnomaly};
pub use metrics_store::{RecordedAttempt, RunMetricsStore};
pub use reconciliation_driver::{
    Candidate, CredentialStore, Eligibility, PassSummary, ReconciliationDriver, RunOutcome,
    RunReport, Selection,
};
pub use stability::{StabilityEvaluator, StabilityReport};
pub use step_recorder::StepRecorder;
pub use verification::VerificationStateMachine;
