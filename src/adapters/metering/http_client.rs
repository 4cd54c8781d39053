//! HTTP metering client with client-side rate limiting.
//!
//! Wraps `GET {base_url}/v1/usage`. A single `query` call follows
//! pagination until the server reports no more pages; it never retries.
//! Retrying is the reconciliation driver's job, so that one slow or
//! throttled run cannot hold a worker indefinitely.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};

use crate::domain::models::{Config, RateLimitConfig};
use crate::domain::ports::{
    AggregateResult, AggregateUsage, Credential, MeteringClient, TimeWindow, UnavailableReason,
};

use super::models::UsagePage;

/// Upper bound on pages followed for one window.
const MAX_PAGES: usize = 1_000;

/// HTTP client for the metering usage endpoint.
#[derive(Clone)]
pub struct HttpMeteringClient {
    http: Client,
    base_url: String,
    page_size: u32,
    /// Shared by every clone, so all workers draw from one budget.
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl HttpMeteringClient {
    pub fn new(
        base_url: impl Into<String>,
        page_size: u32,
        request_timeout: Duration,
        rate_limit: &RateLimitConfig,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("usage-reconciler/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let per_second = NonZeroU32::new(rate_limit.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(rate_limit.burst_size).unwrap_or(per_second);
        let limiter = RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst));

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
            limiter: Arc::new(limiter),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        Self::new(
            config.metering.base_url.clone(),
            config.metering.page_size,
            Duration::from_secs(config.metering.request_timeout_secs),
            &config.rate_limit,
        )
    }

    async fn fetch_page(
        &self,
        credential: &Credential,
        window: TimeWindow,
        filter: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<UsagePage, UnavailableReason> {
        self.limiter.until_ready().await;

        let mut params: Vec<(&str, String)> = vec![
            ("start", window.start.timestamp().to_string()),
            ("end", window.end.timestamp().to_string()),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(filter) = filter {
            params.push(("filter", filter.to_string()));
        }
        if let Some(cursor) = cursor {
            params.push(("page", cursor.to_string()));
        }

        let response = self
            .http
            .get(format!("{}/v1/usage", self.base_url))
            .bearer_auth(credential.secret())
            .header("Accept", "application/json")
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UnavailableReason::Transport("request timed out".to_string())
                } else {
                    UnavailableReason::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(UnavailableReason::Unauthorized(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    body.trim()
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(UnavailableReason::RateLimited { retry_after });
            }
            s if !s.is_success() => {
                return Err(UnavailableReason::Transport(format!("HTTP {}", s.as_u16())));
            }
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|e| UnavailableReason::Transport(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| UnavailableReason::Malformed(e.to_string()))
    }
}

#[async_trait]
impl MeteringClient for HttpMeteringClient {
    async fn query(
        &self,
        credential: &Credential,
        window: TimeWindow,
        filter: Option<&str>,
    ) -> AggregateResult {
        let mut total = AggregateUsage::default();
        let mut cursor: Option<String> = None;

        for page_number in 0..MAX_PAGES {
            let page = match self.fetch_page(credential, window, filter, cursor.as_deref()).await {
                Ok(page) => page,
                Err(reason) => {
                    tracing::debug!(
                        credential = %credential.name,
                        page = page_number,
                        %reason,
                        "Metering query unavailable"
                    );
                    return AggregateResult::Unavailable(reason);
                }
            };
            if let Err(reason) = page.accumulate(&mut total) {
                tracing::warn!(credential = %credential.name, page = page_number, %reason, "Rejected metering page");
                return AggregateResult::Unavailable(reason);
            }

            if !page.has_more {
                return AggregateResult::Usage(total);
            }
            match page.next_page {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(_) => {
                    return AggregateResult::Unavailable(UnavailableReason::Malformed(
                        "pagination cursor did not advance".to_string(),
                    ))
                }
                None => {
                    return AggregateResult::Unavailable(UnavailableReason::Malformed(
                        "has_more set without next_page".to_string(),
                    ))
                }
            }
        }

        AggregateResult::Unavailable(UnavailableReason::Malformed(format!(
            "more than {MAX_PAGES} pages for one window"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            Utc.timestamp_opt(1_700_000_300, 0).unwrap(),
        )
    }

    fn client(url: &str) -> HttpMeteringClient {
        let rate = RateLimitConfig { requests_per_second: 100, burst_size: 100 };
        HttpMeteringClient::new(url, 100, Duration::from_secs(5), &rate).unwrap()
    }

    fn credential() -> Credential {
        Credential::new("default", "sk-test")
    }

    #[tokio::test]
    async fn test_sends_window_and_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/usage")
            .match_header("authorization", "Bearer sk-test")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("start".into(), "1700000000".into()),
                Matcher::UrlEncoded("end".into(), "1700000300".into()),
                Matcher::UrlEncoded("filter".into(), "workspace=wf".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"data":[{"results":[{"input_units":10,"output_units":4,"request_count":1}]}],"has_more":false}"#)
            .create_async()
            .await;

        let result = client(&server.url()).query(&credential(), window(), Some("workspace=wf")).await;
        assert_eq!(
            result,
            AggregateResult::Usage(AggregateUsage { input_units: 10, output_units: 4, request_count: 1 })
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_follows_pagination() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/v1/usage")
            .match_query(Matcher::Regex("limit=100$".into()))
            .with_status(200)
            .with_body(r#"{"data":[{"results":[{"input_units":100,"output_units":50,"request_count":2}]}],"has_more":true,"next_page":"p2"}"#)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/v1/usage")
            .match_query(Matcher::UrlEncoded("page".into(), "p2".into()))
            .with_status(200)
            .with_body(r#"{"data":[{"results":[{"input_units":1,"output_units":2,"request_count":1}]}],"has_more":false,"next_page":null}"#)
            .create_async()
            .await;

        let result = client(&server.url()).query(&credential(), window(), None).await;
        assert_eq!(
            result,
            AggregateResult::Usage(AggregateUsage { input_units: 101, output_units: 52, request_count: 3 })
        );
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_maps_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/usage")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("invalid key")
            .create_async()
            .await;

        let result = client(&server.url()).query(&credential(), window(), None).await;
        assert!(matches!(result, AggregateResult::Unavailable(UnavailableReason::Unauthorized(ref m)) if m.contains("401")));
    }

    #[tokio::test]
    async fn test_maps_rate_limit_with_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/usage")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let result = client(&server.url()).query(&credential(), window(), None).await;
        assert_eq!(
            result,
            AggregateResult::Unavailable(UnavailableReason::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
    }

    #[tokio::test]
    async fn test_maps_server_error_and_bad_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/usage")
            .match_query(Matcher::UrlEncoded("filter".into(), "broken".into()))
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;
        server
            .mock("GET", "/v1/usage")
            .match_query(Matcher::Regex("limit=100$".into()))
            .with_status(503)
            .create_async()
            .await;

        let c = client(&server.url());
        assert!(matches!(
            c.query(&credential(), window(), Some("broken")).await,
            AggregateResult::Unavailable(UnavailableReason::Malformed(_))
        ));
        assert!(matches!(
            c.query(&credential(), window(), None).await,
            AggregateResult::Unavailable(UnavailableReason::Transport(ref m)) if m == "HTTP 503"
        ));
    }

    #[tokio::test]
    async fn test_oversized_counter_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/usage")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(
                r#"{{"data":[{{"results":[{{"input_units":{},"output_units":1,"request_count":1}}]}}],"has_more":false}}"#,
                i64::MAX as u64 + 10
            ))
            .create_async()
            .await;

        let result = client(&server.url()).query(&credential(), window(), None).await;
        assert!(matches!(result, AggregateResult::Unavailable(UnavailableReason::Malformed(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport() {
        let result = client("http://127.0.0.1:1").query(&credential(), window(), None).await;
        assert!(matches!(result, AggregateResult::Unavailable(UnavailableReason::Transport(_))));
    }
}
