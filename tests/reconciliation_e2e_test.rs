//! End-to-end reconciliation tests
//!
//! Records a two-step run through the step recorder, feeds usage events to
//! the in-memory metering client, and drives reconciliation passes at fixed
//! instants against a migrated in-memory database.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use usage_reconciler::adapters::metering::InMemoryMeteringClient;
use usage_reconciler::adapters::sqlite::{create_migrated_test_pool, SqliteRunRepository};
use usage_reconciler::domain::models::{Config, UsageValue, VerificationStatus};
use usage_reconciler::domain::ports::Credential;
use usage_reconciler::services::{
    CredentialStore, Eligibility, ReconciliationDriver, RunMetricsStore, RunOutcome, Selection,
    StepRecorder, VerificationStateMachine,
};

const T0: i64 = 1_700_000_000;
const RUN_ID: &str = "e2e-run";

fn ts(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(T0 + offset, 0).unwrap()
}

struct TestEnv {
    recorder: StepRecorder<SqliteRunRepository>,
    store: Arc<RunMetricsStore<SqliteRunRepository>>,
    driver: ReconciliationDriver<SqliteRunRepository, InMemoryMeteringClient>,
    client: InMemoryMeteringClient,
}

async fn setup() -> TestEnv {
    let mut config = Config::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;

    let pool = create_migrated_test_pool().await.unwrap();
    let repo = Arc::new(SqliteRunRepository::new(pool));
    let store = Arc::new(RunMetricsStore::new(
        repo.clone(),
        VerificationStateMachine::from_config(&config.reconciliation),
    ));
    let client = InMemoryMeteringClient::new();
    let driver = ReconciliationDriver::new(
        store.clone(),
        Arc::new(client.clone()),
        CredentialStore::from_credentials([Credential::new("default", "sk-test")]),
        &config,
    );

    TestEnv { recorder: StepRecorder::new(repo), store, driver, client }
}

/// Two steps, [T0, T0+300) and [T0+300, T0+600).
async fn record_two_step_run(env: &TestEnv) {
    env.recorder
        .start_run("crewai", "default", Some(RUN_ID.to_string()))
        .await
        .unwrap();
    env.recorder.begin_step_at(RUN_ID, 1, ts(0)).await.unwrap();
    env.recorder.end_step_at(RUN_ID, 1, ts(300)).await.unwrap();
    env.recorder.begin_step_at(RUN_ID, 2, ts(300)).await.unwrap();
    env.recorder.end_step_at(RUN_ID, 2, ts(600)).await.unwrap();
}

/// Step 1 totals (600, 200), step 2 totals (400, 200).
async fn feed_usage(client: &InMemoryMeteringClient) {
    client.record("default", ts(10), 250, 100).await;
    client.record("default", ts(200), 350, 100).await;
    client.record("default", ts(300), 400, 200).await;
}

fn reconciled(summary: &usage_reconciler::services::PassSummary) -> (u32, u64, u64, VerificationStatus, String) {
    assert_eq!(summary.reconciled.len(), 1, "expected exactly one reconciled run");
    match &summary.reconciled[0].outcome {
        RunOutcome::Reconciled { attempt_index, tokens_in, tokens_out, status, message } => {
            (*attempt_index, *tokens_in, *tokens_out, *status, message.clone())
        }
        RunOutcome::Failed { kind, error, .. } => panic!("run failed [{kind}]: {error}"),
    }
}

#[tokio::test]
async fn test_pending_then_verified_with_backfilled_steps() {
    let env = setup().await;
    record_two_step_run(&env).await;
    feed_usage(&env.client).await;

    let summary = env.driver.reconcile(&Selection::run(RUN_ID), ts(1800)).await.unwrap();
    let (index, tokens_in, tokens_out, status, _) = reconciled(&summary);
    assert_eq!((index, tokens_in, tokens_out), (0, 1000, 400));
    assert_eq!(status, VerificationStatus::Pending);

    let summary = env
        .driver
        .reconcile(&Selection::run(RUN_ID), ts(1800 + 3700))
        .await
        .unwrap();
    let (index, _, _, status, message) = reconciled(&summary);
    assert_eq!(index, 1);
    assert_eq!(status, VerificationStatus::Verified);
    assert!(message.contains("1000 tokens in / 400 tokens out"), "{message}");

    let record = env.store.export(RUN_ID, ts(1800 + 3700)).await.unwrap();
    assert_eq!(record.verification_status, VerificationStatus::Verified);
    assert_eq!(record.steps.len(), 2);
    assert_eq!(record.steps[0].tokens_in, UsageValue::Measured(600));
    assert_eq!(record.steps[0].tokens_out, UsageValue::Measured(200));
    assert_eq!(record.steps[1].tokens_in, UsageValue::Measured(400));
    assert_eq!(record.steps[1].tokens_out, UsageValue::Measured(200));
    assert!(record
        .steps
        .iter()
        .all(|s| s.verification_status == VerificationStatus::Verified));

    let attempts = &record.usage_reconciliation.attempts;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].timestamp, T0 + 1800);
    assert_eq!(attempts[1].timestamp, T0 + 1800 + 3700);
    assert_eq!(attempts[1].steps_with_tokens, 2);
    assert_eq!(attempts[1].total_steps, 2);

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["verification_status"], "verified");
    assert_eq!(json["steps"][0]["start_timestamp"], T0);
    assert_eq!(json["steps"][1]["end_timestamp"], T0 + 600);
}

#[tokio::test]
async fn test_usage_regression_is_flagged_as_warning() {
    let env = setup().await;
    record_two_step_run(&env).await;
    feed_usage(&env.client).await;

    env.driver.reconcile(&Selection::run(RUN_ID), ts(1800)).await.unwrap();

    // The metering side revises step 1 downward.
    env.client.clear("default").await;
    env.client.record("default", ts(10), 500, 200).await;
    env.client.record("default", ts(300), 400, 200).await;

    let summary = env
        .driver
        .reconcile(&Selection::run(RUN_ID), ts(1800 + 3700))
        .await
        .unwrap();
    let (_, tokens_in, _, status, message) = reconciled(&summary);
    assert_eq!(tokens_in, 900);
    assert_eq!(status, VerificationStatus::Warning);
    assert!(message.contains("tokens_in decreased by 100"), "{message}");

    // Both measurements survive; the log is never rewritten.
    let log = env.store.attempts(RUN_ID).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log.as_slice()[0].tokens_in, 1000);
}

#[tokio::test]
async fn test_verified_run_is_not_remeasured_unless_forced() {
    let env = setup().await;
    record_two_step_run(&env).await;
    feed_usage(&env.client).await;

    env.driver.reconcile(&Selection::run(RUN_ID), ts(1800)).await.unwrap();
    env.driver
        .reconcile(&Selection::run(RUN_ID), ts(1800 + 3700))
        .await
        .unwrap();
    let queries = env.client.query_count();

    let summary = env
        .driver
        .reconcile(&Selection::run(RUN_ID), ts(1800 + 7400))
        .await
        .unwrap();
    assert!(summary.reconciled.is_empty());
    assert_eq!(summary.skipped[0].eligibility, Eligibility::AlreadyVerified);
    assert_eq!(env.client.query_count(), queries);
    assert_eq!(env.store.attempts(RUN_ID).await.unwrap().len(), 2);

    let forced = Selection { force: true, ..Selection::run(RUN_ID) };
    let summary = env.driver.reconcile(&forced, ts(1800 + 7400)).await.unwrap();
    let (index, _, _, status, _) = reconciled(&summary);
    assert_eq!(index, 2);
    assert_eq!(status, VerificationStatus::Verified);
}

#[tokio::test]
async fn test_passes_at_the_same_instant_keep_attempts_ordered() {
    let env = setup().await;
    record_two_step_run(&env).await;
    feed_usage(&env.client).await;

    for _ in 0..3 {
        env.driver.reconcile(&Selection::run(RUN_ID), ts(1800)).await.unwrap();
    }

    let log = env.store.attempts(RUN_ID).await.unwrap();
    let stamps: Vec<i64> = log.iter().map(|a| a.timestamp.timestamp()).collect();
    assert_eq!(stamps, vec![T0 + 1800, T0 + 1801, T0 + 1802]);
    let indices: Vec<u32> = log.iter().map(|a| a.attempt_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    // Identical values taken seconds apart do not count as stable.
    let outcome = env
        .store
        .evaluate(&env.store.require(RUN_ID).await.unwrap(), ts(1802))
        .await
        .unwrap();
    assert_eq!(outcome.status, VerificationStatus::Pending);
}

#[tokio::test]
async fn test_empty_measurement_on_young_run_is_data_not_available() {
    let env = setup().await;
    record_two_step_run(&env).await;

    let summary = env.driver.reconcile(&Selection::run(RUN_ID), ts(900)).await.unwrap();
    let (_, tokens_in, tokens_out, status, _) = reconciled(&summary);
    assert_eq!((tokens_in, tokens_out), (0, 0));
    assert_eq!(status, VerificationStatus::DataNotAvailable);

    let record = env.store.export(RUN_ID, ts(900)).await.unwrap();
    assert_eq!(record.verification_status, VerificationStatus::DataNotAvailable);
    assert!(record
        .steps
        .iter()
        .all(|s| s.verification_status == VerificationStatus::DataNotAvailable));

    // Read once the run is old enough, the same log no longer means "not yet".
    let record = env.store.export(RUN_ID, ts(600 + 30 * 3600)).await.unwrap();
    assert_eq!(record.verification_status, VerificationStatus::Pending);
}

#[tokio::test]
async fn test_outage_journals_failure_without_attempt() {
    let env = setup().await;
    record_two_step_run(&env).await;
    feed_usage(&env.client).await;
    env.client
        .fail_next(usage_reconciler::domain::ports::UnavailableReason::Transport(
            "connection reset".to_string(),
        ))
        .await;

    let summary = env.driver.reconcile(&Selection::run(RUN_ID), ts(1800)).await.unwrap();
    assert_eq!(summary.failed(), 1);
    // Every selected run failed.
    assert_eq!(summary.exit_code(), 2);
    assert!(env.store.attempts(RUN_ID).await.unwrap().is_empty());

    let failures = env.store.failures(RUN_ID).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].reason.contains("connection reset"));

    // The next pass recovers.
    let summary = env.driver.reconcile(&Selection::run(RUN_ID), ts(1900)).await.unwrap();
    assert_eq!(summary.failed(), 0);
    assert_eq!(env.store.attempts(RUN_ID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reset_returns_run_to_pending() {
    let env = setup().await;
    record_two_step_run(&env).await;
    feed_usage(&env.client).await;

    env.driver.reconcile(&Selection::run(RUN_ID), ts(1800)).await.unwrap();
    env.driver
        .reconcile(&Selection::run(RUN_ID), ts(1800 + 3700))
        .await
        .unwrap();

    env.store.reset(RUN_ID).await.unwrap();

    let record = env.store.export(RUN_ID, ts(1800 + 3700)).await.unwrap();
    assert_eq!(record.verification_status, VerificationStatus::Pending);
    assert!(record.usage_reconciliation.attempts.is_empty());
    assert!(record.usage_reconciliation.verification_message.is_none());
    assert!(record.steps.iter().all(|s| s.tokens_in == UsageValue::Unknown));
}
