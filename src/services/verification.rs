//! Verification state machine.
//!
//! Status is a pure function of the attempt log and the run's age. It is
//! re-derived from scratch on every reconciliation and every read; the
//! status column in the store is only a display cache.

use chrono::Duration;

use crate::domain::models::{
    AttemptLog, ReconciliationConfig, VerificationOutcome, VerificationStatus,
};
use crate::services::anomaly;
use crate::services::stability::{StabilityEvaluator, StabilityReport};

#[derive(Debug, Clone)]
pub struct VerificationStateMachine {
    stability: StabilityEvaluator,
    min_age: Duration,
}

fn minutes(d: Duration) -> i64 {
    d.num_minutes()
}

impl VerificationStateMachine {
    pub fn new(stability: StabilityEvaluator, min_age: Duration) -> Self {
        Self { stability, min_age }
    }

    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self::new(StabilityEvaluator::from_config(config), config.min_age())
    }

    pub fn stability(&self) -> &StabilityEvaluator {
        &self.stability
    }

    /// Evaluate the log. Priority: data_not_available, warning, verified, pending.
    pub fn evaluate(&self, log: &AttemptLog, run_age: Duration) -> VerificationOutcome {
        let report = self.stability.evaluate(log);
        let anomalies = anomaly::scan(log);

        let Some(latest) = log.latest() else {
            return self.outcome(
                VerificationStatus::Pending,
                "No reconciliation attempts yet".to_string(),
                &report,
                0,
            );
        };

        if latest.is_all_zero() && run_age < self.min_age {
            let message = format!(
                "Metering reported no usage yet; run is {} min old (minimum {} min), \
                 usage may still be propagating",
                minutes(run_age).max(0),
                minutes(self.min_age)
            );
            return self.outcome(VerificationStatus::DataNotAvailable, message, &report, anomalies.len());
        }

        if let Some((earlier, later)) = log.latest_pair() {
            if anomaly::detect(earlier, later).is_anomalous {
                let message = format!("Usage decreased: {}", anomaly::describe(earlier, later));
                return self.outcome(VerificationStatus::Warning, message, &report, anomalies.len());
            }
        }

        let history_note = match anomalies.len() {
            0 => String::new(),
            1 => " (1 earlier anomaly in history)".to_string(),
            n => format!(" ({n} earlier anomalies in history)"),
        };

        if report.stable {
            let message = format!(
                "Verified: {} tokens in / {} tokens out stable across {} attempts over {} min{}",
                latest.tokens_in,
                latest.tokens_out,
                report.stable_count,
                minutes(report.elapsed),
                history_note
            );
            return self.outcome(VerificationStatus::Verified, message, &report, anomalies.len());
        }

        let progress = format!("stable {}/{}", report.stable_count, report.required);
        let mut message = match log.latest_pair() {
            Some((earlier, later)) => {
                let change = anomaly::detect(earlier, later);
                if change.is_increasing() {
                    format!(
                        "Pending: usage still increasing (tokens_in {:+}, tokens_out {:+}); {}",
                        change.delta_tokens_in, change.delta_tokens_out, progress
                    )
                } else if report.spacing_blocked {
                    format!(
                        "Pending: values unchanged but only {} min since previous attempt \
                         (need {} min); {}",
                        minutes(later.timestamp - earlier.timestamp),
                        minutes(self.stability.interval()),
                        progress
                    )
                } else {
                    format!("Pending: {progress}")
                }
            }
            None => format!("Pending: first measurement recorded; {progress}"),
        };
        if let Some(next) = report.next_eligible_at {
            message.push_str(&format!("; next confirmation after {}", next.to_rfc3339()));
        }
        message.push_str(&history_note);
        self.outcome(VerificationStatus::Pending, message, &report, anomalies.len())
    }

    fn outcome(
        &self,
        status: VerificationStatus,
        message: String,
        report: &StabilityReport,
        historical_anomalies: usize,
    ) -> VerificationOutcome {
        VerificationOutcome {
            status,
            message,
            stable_count: report.stable_count,
            required_stable: report.required,
            next_eligible_at: report.next_eligible_at,
            historical_anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ReconciliationAttempt, StepUsage};
    use chrono::{TimeZone, Utc};

    const T0: i64 = 1_700_000_000;

    fn machine() -> VerificationStateMachine {
        VerificationStateMachine::from_config(&ReconciliationConfig::default())
    }

    fn attempt(index: u32, minute: i64, steps: &[(u64, u64)]) -> ReconciliationAttempt {
        let usage = steps
            .iter()
            .enumerate()
            .map(|(i, (tokens_in, tokens_out))| StepUsage {
                step_number: i as u32 + 1,
                tokens_in: *tokens_in,
                tokens_out: *tokens_out,
                api_calls: u64::from(*tokens_in > 0),
            })
            .collect();
        ReconciliationAttempt::from_step_usage(index, Utc.timestamp_opt(T0 + minute * 60, 0).unwrap(), usage)
    }

    fn log(attempts: Vec<ReconciliationAttempt>) -> AttemptLog {
        AttemptLog::from_attempts(attempts).unwrap()
    }

    #[test]
    fn test_empty_log_is_pending() {
        let outcome = machine().evaluate(&AttemptLog::new(), Duration::hours(2));
        assert_eq!(outcome.status, VerificationStatus::Pending);
    }

    #[test]
    fn test_age_boundary_for_zero_usage() {
        let zero = log(vec![attempt(0, 0, &[(0, 0)])]);

        let young = machine().evaluate(&zero, Duration::minutes(29));
        assert_eq!(young.status, VerificationStatus::DataNotAvailable);

        let old = machine().evaluate(&zero, Duration::minutes(31));
        assert_eq!(old.status, VerificationStatus::Pending);
    }

    #[test]
    fn test_decrease_wins_over_stability() {
        let outcome = machine().evaluate(
            &log(vec![attempt(0, 0, &[(100, 40)]), attempt(1, 61, &[(50, 40)])]),
            Duration::hours(3),
        );
        assert_eq!(outcome.status, VerificationStatus::Warning);
        assert!(outcome.message.contains("tokens_in"));
        assert!(outcome.message.contains("delta -50"));
    }

    #[test]
    fn test_k_minus_one_stable_attempts_is_pending() {
        let outcome = machine().evaluate(&log(vec![attempt(0, 0, &[(1000, 400)])]), Duration::hours(1));
        assert_eq!(outcome.status, VerificationStatus::Pending);
        assert!(outcome.message.contains("stable 1/2"));
        assert!(outcome.next_eligible_at.is_some());
    }

    #[test]
    fn test_still_increasing_reports_delta() {
        let outcome = machine().evaluate(
            &log(vec![attempt(0, 0, &[(900, 400)]), attempt(1, 61, &[(1000, 400)])]),
            Duration::hours(2),
        );
        assert_eq!(outcome.status, VerificationStatus::Pending);
        assert!(outcome.message.contains("still increasing"));
        assert!(outcome.message.contains("+100"));
    }

    #[test]
    fn test_partial_coverage_still_verifies() {
        let steps = [(100, 10), (0, 0), (200, 20), (0, 0), (300, 30), (0, 0)];
        let outcome = machine().evaluate(
            &log(vec![attempt(0, 0, &steps), attempt(1, 65, &steps)]),
            Duration::hours(2),
        );
        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert!(outcome.message.contains("600 tokens in"));
    }

    #[test]
    fn test_recovery_after_anomaly_verifies_but_keeps_history() {
        let outcome = machine().evaluate(
            &log(vec![
                attempt(0, 0, &[(100, 40)]),
                attempt(1, 60, &[(90, 40)]),
                attempt(2, 120, &[(100, 40)]),
                attempt(3, 180, &[(100, 40)]),
            ]),
            Duration::hours(4),
        );
        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.historical_anomalies, 1);
        assert!(outcome.message.contains("earlier anomaly"));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let attempts = log(vec![attempt(0, 0, &[(10, 1)]), attempt(1, 70, &[(10, 1)])]);
        let first = machine().evaluate(&attempts, Duration::hours(2));
        let second = machine().evaluate(&attempts, Duration::hours(2));
        assert_eq!(first, second);
    }
}
