//! Reconciliation pass CLI command.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Args;
use console::style;

use crate::adapters::metering::HttpMeteringClient;
use crate::cli::commands::open_store;
use crate::cli::output::{list_table, output, render_list, styled_status, truncate, CommandOutput};
use crate::domain::models::{now_seconds, Config, VerificationStatus};
use crate::services::reconciliation_driver::{RunOutcome, SkippedRun};
use crate::services::{Candidate, CredentialStore, Eligibility, PassSummary, ReconciliationDriver, Selection};

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Reconcile only this run (ignores the age window)
    pub selector: Option<String>,

    /// Report eligible runs without querying or writing anything
    #[arg(long)]
    pub list: bool,

    /// Include runs skipped as verified, too recent, too old or in progress
    #[arg(long, short)]
    pub verbose: bool,

    /// Re-measure runs even if already verified
    #[arg(long)]
    pub force: bool,

    /// Minimum age since run end, in minutes
    #[arg(long, value_name = "MINUTES")]
    pub min_age: Option<u64>,

    /// Maximum age since run end, in hours
    #[arg(long, value_name = "HOURS")]
    pub max_age: Option<u64>,

    /// Only runs of this framework
    #[arg(long)]
    pub framework: Option<String>,
}

impl ReconcileArgs {
    fn selection(&self) -> Selection {
        Selection {
            run_id: self.selector.clone(),
            framework_id: self.framework.clone(),
            force: self.force,
            min_age: self.min_age.map(|m| Duration::minutes(m as i64)),
            max_age: self.max_age.map(|h| Duration::hours(h as i64)),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct CandidateListOutput {
    pub candidates: Vec<Candidate>,
    pub total: usize,
}

impl CommandOutput for CandidateListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["run", "framework", "age", "status", "eligibility", "detail"]);
        for c in &self.candidates {
            let detail = match c.next_eligible_at {
                Some(at) if c.status != VerificationStatus::Verified => {
                    format!("next confirmation after {}", at.format("%Y-%m-%d %H:%M:%S UTC"))
                }
                _ => truncate(&c.message, 60),
            };
            table.add_row(vec![
                truncate(&c.run_id, 36),
                c.framework_id.clone(),
                format!("{} min", c.age_min),
                styled_status(c.status),
                c.eligibility.to_string(),
                detail,
            ]);
        }
        render_list("run", &table, self.total)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct PassOutput {
    #[serde(flatten)]
    pub summary: PassSummary,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip)]
    pub verbose: bool,
}

impl CommandOutput for PassOutput {
    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        if self.summary.reconciled.is_empty() {
            lines.push("Nothing to reconcile.".to_string());
        }
        for report in &self.summary.reconciled {
            match &report.outcome {
                RunOutcome::Reconciled { attempt_index, tokens_in, tokens_out, status, message } => {
                    lines.push(format!(
                        "{} {} attempt #{} in={} out={}: {}",
                        styled_status(*status),
                        report.run_id,
                        attempt_index + 1,
                        tokens_in,
                        tokens_out,
                        message
                    ));
                }
                RunOutcome::Failed { kind, error, .. } => {
                    lines.push(format!("{} {} [{}]: {}", style("failed").red().bold(), report.run_id, kind, error));
                }
            }
        }
        if self.verbose {
            for SkippedRun { run_id, eligibility } in &self.summary.skipped {
                lines.push(format!("{} {}: {}", style("skipped").dim(), run_id, eligibility));
            }
        }
        lines.push(format!(
            "\n{} reconciled, {} failed, {} skipped",
            self.succeeded,
            self.failed,
            self.summary.skipped.len()
        ));
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Returns the process exit code computed by `PassSummary::exit_code`.
pub async fn execute(args: ReconcileArgs, config: &Config, json_mode: bool) -> Result<i32> {
    let credentials = CredentialStore::from_config(&config.metering);
    if credentials.is_empty() && !args.list {
        let vars: Vec<&str> = config.metering.credentials.values().map(String::as_str).collect();
        anyhow::bail!(
            "No metering credential could be resolved; set one of: {}",
            vars.join(", ")
        );
    }

    let store = open_store(config).await?;
    let client = HttpMeteringClient::from_config(config).context("Failed to build metering HTTP client")?;
    let driver = ReconciliationDriver::new(store, Arc::new(client), credentials, config);

    let selection = args.selection();
    let now = now_seconds();

    if args.list {
        let candidates: Vec<Candidate> = driver
            .discover(&selection, now)
            .await?
            .into_iter()
            .filter(|c| args.verbose || c.eligibility == Eligibility::Eligible)
            .collect();
        output(
            &CandidateListOutput { total: candidates.len(), candidates },
            json_mode,
        );
        return Ok(0);
    }

    let summary = driver.reconcile(&selection, now).await?;
    let exit_code = summary.exit_code();
    output(
        &PassOutput {
            succeeded: summary.succeeded(),
            failed: summary.failed(),
            verbose: args.verbose,
            summary,
        },
        json_mode,
    );
    Ok(exit_code)
}
