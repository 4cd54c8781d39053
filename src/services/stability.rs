//! Stability evaluation over the trailing window of an attempt log.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::models::{AttemptLog, ReconciliationConfig};

/// Result of checking the trailing attempts for agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StabilityReport {
    pub stable: bool,
    /// Length of the trailing chain of agreeing, well-spaced attempts (capped at `required`).
    pub stable_count: usize,
    pub required: usize,
    /// Time spanned by the stable chain.
    #[serde(skip)]
    pub elapsed: Duration,
    /// The latest pair agrees but was taken too close together.
    pub spacing_blocked: bool,
    /// Earliest time a new attempt can extend the chain.
    pub next_eligible_at: Option<DateTime<Utc>>,
}

/// Decides whether the last `required` attempts agree and are spaced at
/// least `interval` apart. Older divergent attempts never block a later
/// stable window.
#[derive(Debug, Clone)]
pub struct StabilityEvaluator {
    required: usize,
    interval: Duration,
}

impl StabilityEvaluator {
    pub fn new(required: usize, interval: Duration) -> Self {
        if required <= 1 {
            tracing::warn!(
                required,
                "min_stable_verifications <= 1: a single measurement counts as verified; \
                 use only for development"
            );
        }
        Self {
            required: required.max(1),
            interval,
        }
    }

    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self::new(config.min_stable_verifications, config.verification_interval())
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn evaluate(&self, log: &AttemptLog) -> StabilityReport {
        let attempts = log.as_slice();
        let Some(latest) = attempts.last() else {
            return StabilityReport {
                stable: false,
                stable_count: 0,
                required: self.required,
                elapsed: Duration::zero(),
                spacing_blocked: false,
                next_eligible_at: None,
            };
        };

        let mut stable_count = 1;
        let mut window_start = latest.timestamp;
        for pair in attempts.windows(2).rev() {
            if stable_count >= self.required {
                break;
            }
            let (earlier, later) = (&pair[0], &pair[1]);
            let agrees = earlier.token_pair() == later.token_pair();
            let spaced = later.timestamp - earlier.timestamp >= self.interval;
            if !(agrees && spaced) {
                break;
            }
            stable_count += 1;
            window_start = earlier.timestamp;
        }

        let spacing_blocked = log.latest_pair().is_some_and(|(earlier, later)| {
            earlier.token_pair() == later.token_pair()
                && later.timestamp - earlier.timestamp < self.interval
        });

        let stable = stable_count >= self.required;
        StabilityReport {
            stable,
            stable_count,
            required: self.required,
            elapsed: latest.timestamp - window_start,
            spacing_blocked,
            next_eligible_at: (!stable).then(|| latest.timestamp + self.interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ReconciliationAttempt, StepUsage};
    use chrono::TimeZone;

    const T0: i64 = 1_700_000_000;

    fn attempt(index: u32, minute: i64, tokens_in: u64, tokens_out: u64) -> ReconciliationAttempt {
        ReconciliationAttempt::from_step_usage(
            index,
            Utc.timestamp_opt(T0 + minute * 60, 0).unwrap(),
            vec![StepUsage { step_number: 1, tokens_in, tokens_out, api_calls: 2 }],
        )
    }

    fn log(attempts: Vec<ReconciliationAttempt>) -> AttemptLog {
        AttemptLog::from_attempts(attempts).unwrap()
    }

    fn evaluator() -> StabilityEvaluator {
        StabilityEvaluator::new(2, Duration::minutes(60))
    }

    #[test]
    fn test_empty_log_is_not_stable() {
        let report = evaluator().evaluate(&AttemptLog::new());
        assert!(!report.stable);
        assert_eq!(report.stable_count, 0);
        assert_eq!(report.required, 2);
    }

    #[test]
    fn test_fewer_than_k_attempts_is_not_stable() {
        let report = evaluator().evaluate(&log(vec![attempt(0, 0, 1000, 400)]));
        assert!(!report.stable);
        assert_eq!(report.stable_count, 1);
        assert_eq!(report.next_eligible_at, Some(Utc.timestamp_opt(T0 + 3600, 0).unwrap()));
    }

    #[test]
    fn test_k_identical_spaced_attempts_are_stable() {
        let report = evaluator().evaluate(&log(vec![
            attempt(0, 0, 1000, 400),
            attempt(1, 61, 1000, 400),
        ]));
        assert!(report.stable);
        assert_eq!(report.stable_count, 2);
        assert_eq!(report.elapsed, Duration::minutes(61));
        assert!(report.next_eligible_at.is_none());
    }

    #[test]
    fn test_identical_but_too_close_is_not_stable() {
        let report = evaluator().evaluate(&log(vec![
            attempt(0, 0, 1000, 400),
            attempt(1, 10, 1000, 400),
        ]));
        assert!(!report.stable);
        assert!(report.spacing_blocked);
        assert_eq!(report.stable_count, 1);
    }

    #[test]
    fn test_older_divergent_attempt_does_not_block() {
        let report = evaluator().evaluate(&log(vec![
            attempt(0, 0, 10, 4),
            attempt(1, 60, 900, 300),
            attempt(2, 120, 1000, 400),
            attempt(3, 180, 1000, 400),
        ]));
        assert!(report.stable);
    }

    #[test]
    fn test_close_attempt_in_middle_is_bridged_later() {
        let evaluator = StabilityEvaluator::new(3, Duration::minutes(60));
        let attempts = vec![
            attempt(0, 0, 5, 5),
            attempt(1, 60, 5, 5),
            attempt(2, 70, 5, 5),
            attempt(3, 130, 5, 5),
        ];
        let report = evaluator.evaluate(&log(attempts.clone()));
        assert!(!report.stable);
        assert_eq!(report.stable_count, 2);

        let mut extended = attempts;
        extended.push(attempt(4, 190, 5, 5));
        assert!(evaluator.evaluate(&log(extended)).stable);
    }

    #[test]
    fn test_single_required_attempt_is_allowed() {
        let evaluator = StabilityEvaluator::new(1, Duration::minutes(60));
        assert!(evaluator.evaluate(&log(vec![attempt(0, 0, 1, 1)])).stable);
    }
}
