//! Wire types for the metering usage endpoint.

use serde::Deserialize;

use crate::domain::ports::{AggregateUsage, UnavailableReason};

/// One page of `GET /v1/usage`.
#[derive(Debug, Clone, Deserialize)]
pub struct UsagePage {
    #[serde(default)]
    pub data: Vec<UsageBucket>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_page: Option<String>,
}

/// A time bucket. Bucket boundaries are the server's choice and do not
/// affect the sum.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageBucket {
    #[serde(default)]
    pub starting_at: Option<String>,
    #[serde(default)]
    pub results: Vec<UsageResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageResult {
    #[serde(default)]
    pub input_units: u64,
    #[serde(default)]
    pub output_units: u64,
    #[serde(default)]
    pub request_count: u64,
}

impl UsagePage {
    /// Add every record on this page into `total`.
    pub fn accumulate(&self, total: &mut AggregateUsage) -> Result<(), UnavailableReason> {
        for result in self.data.iter().flat_map(|b| b.results.iter()) {
            total.add(result.input_units, result.output_units, result.request_count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_sums_all_buckets() {
        let page: UsagePage = serde_json::from_str(
            r#"{
                "data": [
                    {"starting_at": "2024-01-01T00:00:00Z", "results": [
                        {"input_units": 100, "output_units": 40, "request_count": 1},
                        {"input_units": 5, "output_units": 1, "request_count": 1}
                    ]},
                    {"starting_at": "2024-01-01T00:01:00Z", "results": []},
                    {"results": [{"input_units": 7}]}
                ],
                "has_more": false,
                "next_page": null
            }"#,
        )
        .unwrap();

        let mut total = AggregateUsage::default();
        page.accumulate(&mut total).unwrap();
        assert_eq!(total, AggregateUsage { input_units: 112, output_units: 41, request_count: 2 });
    }

    #[test]
    fn test_counter_beyond_storable_range_is_malformed() {
        let page: UsagePage = serde_json::from_str(&format!(
            r#"{{"data": [{{"results": [
                {{"input_units": {}, "output_units": 1, "request_count": 1}},
                {{"input_units": 20, "output_units": 1, "request_count": 1}}
            ]}}]}}"#,
            i64::MAX as u64 - 10
        ))
        .unwrap();

        let mut total = AggregateUsage::default();
        let err = page.accumulate(&mut total).unwrap_err();
        assert!(matches!(err, UnavailableReason::Malformed(_)));
        // The record that did fit was kept; the offending one was not.
        assert_eq!(total.input_units, i64::MAX as u64 - 10);

        let huge: UsagePage =
            serde_json::from_str(&format!(r#"{{"data": [{{"results": [{{"output_units": {}}}]}}]}}"#, u64::MAX)).unwrap();
        assert!(huge.accumulate(&mut AggregateUsage::default()).is_err());
    }
}
