//! Show a run's exported reconciliation record.

use anyhow::Result;
use clap::Args;
use console::style;

use crate::cli::commands::open_store;
use crate::cli::output::{list_table, output, styled_status, CommandOutput};
use crate::domain::models::{now_seconds, Config, ReconciliationAttempt, ReconciliationFailure, RunRecord, VerificationOutcome};
use crate::services::anomaly;
use crate::services::LocatedAnomaly;

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Run to display
    pub run_id: String,
}

/// Human view carries the live evaluation; JSON is the exported record only.
#[derive(Debug, serde::Serialize)]
#[serde(transparent)]
pub struct ShowOutput {
    pub record: RunRecord,
    #[serde(skip)]
    pub outcome: VerificationOutcome,
    #[serde(skip)]
    pub attempts: Vec<ReconciliationAttempt>,
    #[serde(skip)]
    pub anomalies: Vec<LocatedAnomaly>,
    #[serde(skip)]
    pub failures: Vec<ReconciliationFailure>,
}

impl CommandOutput for ShowOutput {
    fn to_human(&self) -> String {
        let record = &self.record;
        let mut lines = vec![
            format!("{} {}", style("Run").bold(), record.run_id),
            format!("Framework: {}", record.framework_id),
            format!(
                "Status:    {} ({}/{} stable)",
                styled_status(self.outcome.status),
                self.outcome.stable_count,
                self.outcome.required_stable
            ),
            format!("Message:   {}", self.outcome.message),
        ];
        if let Some(at) = self.outcome.next_eligible_at {
            lines.push(format!("Next:      after {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
        }

        let mut steps = list_table(&["step", "start", "end", "in", "out", "calls", "status"]);
        for s in &record.steps {
            steps.add_row(vec![
                s.step_number.to_string(),
                s.start_timestamp.to_string(),
                s.end_timestamp.map_or_else(|| "open".to_string(), |t| t.to_string()),
                s.tokens_in.to_string(),
                s.tokens_out.to_string(),
                s.api_calls.to_string(),
                styled_status(s.verification_status),
            ]);
        }
        lines.push(format!("\n{}\n{}", style("Steps").bold(), steps));

        if self.attempts.is_empty() {
            lines.push("\nNo reconciliation attempts yet.".to_string());
        } else {
            let mut attempts = list_table(&["#", "at", "in", "out", "calls", "coverage"]);
            for a in &self.attempts {
                attempts.add_row(vec![
                    (a.attempt_index + 1).to_string(),
                    a.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                    a.tokens_in.to_string(),
                    a.tokens_out.to_string(),
                    a.api_calls.to_string(),
                    format!("{}/{} ({:.0}%)", a.steps_with_data, a.total_steps, a.coverage() * 100.0),
                ]);
            }
            lines.push(format!("\n{}\n{}", style("Attempts").bold(), attempts));
        }

        if !self.anomalies.is_empty() {
            lines.push(format!("\n{}", style("Anomalies").red().bold()));
            lines.extend(self.anomalies.iter().map(|a| format!("  {}", a.description)));
        }

        if !self.failures.is_empty() {
            lines.push(format!("\n{}", style("Failures").yellow().bold()));
            lines.extend(self.failures.iter().map(|f| {
                format!("  {} [{}] {}", f.timestamp.format("%Y-%m-%d %H:%M:%S"), f.kind, f.reason)
            }));
        }

        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.record).unwrap_or_default()
    }
}

pub async fn execute(args: ShowArgs, config: &Config, json_mode: bool) -> Result<()> {
    let store = open_store(config).await?;
    let run = store.require(&args.run_id).await?;
    let log = store.attempts(&args.run_id).await?;
    let now = now_seconds();
    let outcome = store.evaluate(&run, now).await?;
    let record = store.export(&args.run_id, now).await?;

    output(
        &ShowOutput {
            anomalies: anomaly::scan(&log),
            attempts: log.as_slice().to_vec(),
            failures: store.failures(&args.run_id).await?,
            record,
            outcome,
        },
        json_mode,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AttemptLog, Run, Step, StepUsage, VerificationStatus};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_human_view_shows_attempt_coverage() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut run = Run::with_id("r1", "fw", "default");
        run.steps = vec![Step::started(1, at), Step::started(2, at)];
        let attempt = ReconciliationAttempt::from_step_usage(
            0,
            at,
            vec![
                StepUsage { step_number: 1, tokens_in: 10, tokens_out: 2, api_calls: 1 },
                StepUsage { step_number: 2, tokens_in: 0, tokens_out: 0, api_calls: 0 },
            ],
        );
        let log = AttemptLog::from_attempts(vec![attempt]).unwrap();
        let outcome = VerificationOutcome {
            status: VerificationStatus::Pending,
            message: "stable 1/2".to_string(),
            stable_count: 1,
            required_stable: 2,
            next_eligible_at: None,
            historical_anomalies: 0,
        };

        let view = ShowOutput {
            record: RunRecord::from_parts(&run, &log, &outcome, Vec::new()),
            attempts: log.as_slice().to_vec(),
            anomalies: Vec::new(),
            failures: Vec::new(),
            outcome,
        };
        let text = view.to_human();
        assert!(text.contains("1/2 (50%)"), "{text}");
        assert_eq!(view.to_json()["usage_reconciliation"]["verification_message"], "stable 1/2");
    }
}
