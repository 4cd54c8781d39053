//! Detection of decreasing usage between consecutive attempts.
//!
//! Counts reported by the metering API may only grow while data propagates.
//! A later attempt reporting fewer tokens than an earlier one is never
//! silently accepted.

use serde::Serialize;

use crate::domain::models::{AttemptLog, ReconciliationAttempt};

/// Comparison of two adjacent attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnomalyReport {
    pub is_anomalous: bool,
    pub delta_tokens_in: i64,
    pub delta_tokens_out: i64,
}

impl AnomalyReport {
    /// Metrics that went down, with their (negative) deltas.
    pub fn decreasing_metrics(&self) -> Vec<(&'static str, i64)> {
        let mut metrics = Vec::new();
        if self.delta_tokens_in < 0 {
            metrics.push(("tokens_in", self.delta_tokens_in));
        }
        if self.delta_tokens_out < 0 {
            metrics.push(("tokens_out", self.delta_tokens_out));
        }
        metrics
    }

    pub fn is_increasing(&self) -> bool {
        !self.is_anomalous && (self.delta_tokens_in > 0 || self.delta_tokens_out > 0)
    }
}

/// An anomalous pair located in an attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedAnomaly {
    pub earlier_index: u32,
    pub later_index: u32,
    pub report: AnomalyReport,
    pub description: String,
}

/// Signed change, clamped to the `i64` range.
fn delta(earlier: u64, later: u64) -> i64 {
    let d = i128::from(later) - i128::from(earlier);
    i64::try_from(d).unwrap_or(if d < 0 { i64::MIN } else { i64::MAX })
}

/// Compare two adjacent attempts.
pub fn detect(earlier: &ReconciliationAttempt, later: &ReconciliationAttempt) -> AnomalyReport {
    let delta_tokens_in = delta(earlier.tokens_in, later.tokens_in);
    let delta_tokens_out = delta(earlier.tokens_out, later.tokens_out);
    AnomalyReport {
        is_anomalous: delta_tokens_in < 0 || delta_tokens_out < 0,
        delta_tokens_in,
        delta_tokens_out,
    }
}

/// Human-readable description naming each decreasing metric and its magnitude.
pub fn describe(earlier: &ReconciliationAttempt, later: &ReconciliationAttempt) -> String {
    let report = detect(earlier, later);
    let parts: Vec<String> = report
        .decreasing_metrics()
        .into_iter()
        .map(|(metric, d)| {
            let (before, after) = match metric {
                "tokens_in" => (earlier.tokens_in, later.tokens_in),
                _ => (earlier.tokens_out, later.tokens_out),
            };
            format!("{metric} decreased by {} ({before} -> {after}, delta {d})", d.unsigned_abs())
        })
        .collect();

    format!(
        "{} between attempt #{} and #{}",
        parts.join("; "),
        earlier.attempt_index + 1,
        later.attempt_index + 1
    )
}

/// Every anomalous adjacent pair in the log, oldest first.
pub fn scan(log: &AttemptLog) -> Vec<LocatedAnomaly> {
    log.pairs()
        .filter_map(|(earlier, later)| {
            let report = detect(earlier, later);
            report.is_anomalous.then(|| LocatedAnomaly {
                earlier_index: earlier.attempt_index,
                later_index: later.attempt_index,
                report,
                description: describe(earlier, later),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::StepUsage;
    use chrono::{TimeZone, Utc};

    fn attempt(index: u32, tokens_in: u64, tokens_out: u64) -> ReconciliationAttempt {
        ReconciliationAttempt::from_step_usage(
            index,
            Utc.timestamp_opt(1_000 + i64::from(index) * 3_600, 0).unwrap(),
            vec![StepUsage { step_number: 1, tokens_in, tokens_out, api_calls: 1 }],
        )
    }

    #[test]
    fn test_decrease_in_tokens_in_is_anomalous() {
        let report = detect(&attempt(0, 100, 40), &attempt(1, 50, 40));
        assert!(report.is_anomalous);
        assert_eq!(report.delta_tokens_in, -50);
        assert_eq!(report.delta_tokens_out, 0);
        assert_eq!(report.decreasing_metrics(), vec![("tokens_in", -50)]);

        let text = describe(&attempt(0, 100, 40), &attempt(1, 50, 40));
        assert!(text.contains("tokens_in"));
        assert!(text.contains("delta -50"));
    }

    #[test]
    fn test_delta_at_counter_extremes_does_not_overflow() {
        let report = detect(&attempt(0, u64::MAX, 0), &attempt(1, 0, u64::MAX));
        assert!(report.is_anomalous);
        assert_eq!(report.delta_tokens_in, i64::MIN);
        assert_eq!(report.delta_tokens_out, i64::MAX);
    }

    #[test]
    fn test_increase_is_expected() {
        let report = detect(&attempt(0, 100, 40), &attempt(1, 150, 45));
        assert!(!report.is_anomalous);
        assert!(report.is_increasing());
    }

    #[test]
    fn test_both_metrics_reported_when_both_drop() {
        let text = describe(&attempt(0, 100, 40), &attempt(1, 90, 30));
        assert!(text.contains("tokens_in decreased by 10"));
        assert!(text.contains("tokens_out decreased by 10"));
    }

    #[test]
    fn test_scan_keeps_recovered_anomalies_visible() {
        let log = AttemptLog::from_attempts(vec![
            attempt(0, 100, 40),
            attempt(1, 80, 40),
            attempt(2, 100, 40),
            attempt(3, 100, 40),
        ])
        .unwrap();

        let anomalies = scan(&log);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].earlier_index, 0);
        assert_eq!(anomalies[0].later_index, 1);
    }
}
