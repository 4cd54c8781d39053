//! In-memory metering client.
//!
//! Holds raw usage events per credential and sums the ones inside each
//! queried window, which is how the real endpoint behaves. Failures can be
//! queued to simulate outages, throttling, and revoked keys. Workspace
//! filters are accepted and ignored.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::ports::{
    AggregateResult, AggregateUsage, Credential, MeteringClient, TimeWindow, UnavailableReason,
};

/// A single billed request.
#[derive(Debug, Clone)]
struct UsageEvent {
    timestamp: DateTime<Utc>,
    input_units: u64,
    output_units: u64,
}

#[derive(Default)]
struct State {
    events: HashMap<String, Vec<UsageEvent>>,
    rejected: HashSet<String>,
    scripted_failures: VecDeque<UnavailableReason>,
}

#[derive(Clone, Default)]
pub struct InMemoryMeteringClient {
    state: Arc<RwLock<State>>,
    queries: Arc<AtomicUsize>,
}

impl InMemoryMeteringClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a billed request against `credential`.
    pub async fn record(
        &self,
        credential: &str,
        timestamp: DateTime<Utc>,
        input_units: u64,
        output_units: u64,
    ) {
        self.state
            .write()
            .await
            .events
            .entry(credential.to_string())
            .or_default()
            .push(UsageEvent { timestamp, input_units, output_units });
    }

    /// Drop every event for `credential`.
    pub async fn clear(&self, credential: &str) {
        self.state.write().await.events.remove(credential);
    }

    /// Treat `credential` as revoked from now on.
    pub async fn reject_credential(&self, credential: &str) {
        self.state.write().await.rejected.insert(credential.to_string());
    }

    /// Fail the next query with `reason`. Queued failures are consumed in order.
    pub async fn fail_next(&self, reason: UnavailableReason) {
        self.state.write().await.scripted_failures.push_back(reason);
    }

    /// Queries served so far, including failed ones.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeteringClient for InMemoryMeteringClient {
    async fn query(
        &self,
        credential: &Credential,
        window: TimeWindow,
        _filter: Option<&str>,
    ) -> AggregateResult {
        self.queries.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.state.write().await;
            if state.rejected.contains(&credential.name) {
                return AggregateResult::Unavailable(UnavailableReason::Unauthorized(format!(
                    "credential '{}' revoked",
                    credential.name
                )));
            }
            if let Some(reason) = state.scripted_failures.pop_front() {
                return AggregateResult::Unavailable(reason);
            }
        }

        let state = self.state.read().await;
        let mut total = AggregateUsage::default();
        for event in state.events.get(&credential.name).into_iter().flatten() {
            if window.contains(event.timestamp) {
                if let Err(reason) = total.add(event.input_units, event.output_units, 1) {
                    return AggregateResult::Unavailable(reason);
                }
            }
        }
        AggregateResult::Usage(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_window_is_half_open() {
        let client = InMemoryMeteringClient::new();
        client.record("default", ts(0), 10, 1).await;
        client.record("default", ts(299), 20, 2).await;
        client.record("default", ts(300), 40, 4).await;
        client.record("other", ts(10), 1000, 1000).await;

        let cred = Credential::new("default", "secret");
        let result = client.query(&cred, TimeWindow::new(ts(0), ts(300)), None).await;
        assert_eq!(
            result,
            AggregateResult::Usage(AggregateUsage { input_units: 30, output_units: 3, request_count: 2 })
        );
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let client = InMemoryMeteringClient::new();
        client.fail_next(UnavailableReason::Transport("reset".to_string())).await;

        let cred = Credential::new("default", "secret");
        let window = TimeWindow::new(ts(0), ts(10));
        assert!(matches!(client.query(&cred, window, None).await, AggregateResult::Unavailable(_)));
        assert!(matches!(client.query(&cred, window, None).await, AggregateResult::Usage(_)));
        assert_eq!(client.query_count(), 2);
    }
}
