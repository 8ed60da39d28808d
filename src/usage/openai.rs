use super::{UsageSource, UsageWindow};
use crate::error::UsageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const PAGE_LIMIT: u32 = 1440;
const MAX_PAGES: usize = 50;

/// Client for the organization completions-usage endpoint.
///
/// Requires an admin key; regular project keys are rejected by the API.
pub struct OpenAiUsageClient {
    client: Client,
    api_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct UsagePage {
    #[serde(default)]
    data: Vec<UsageBucket>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBucket {
    #[serde(default)]
    results: Vec<UsageResult>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageResult {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    input_cached_tokens: u64,
    #[serde(default)]
    num_model_requests: u64,
}

impl UsagePage {
    fn totals(&self) -> UsageWindow {
        let mut window = UsageWindow::default();
        for result in self.data.iter().flat_map(|b| &b.results) {
            window.add(UsageWindow {
                tokens_in: result.input_tokens,
                tokens_out: result.output_tokens,
                cached_tokens: result.input_cached_tokens,
                requests: result.num_model_requests,
            });
        }
        window
    }
}

/// Bucket-aligned `[start, end)` bounds in unix seconds
fn window_bounds(start: DateTime<Utc>, end: DateTime<Utc>) -> (i64, i64) {
    let start = start.timestamp();
    let end = end.timestamp().max(start) + 1;
    (start - start.rem_euclid(60), end)
}

impl OpenAiUsageClient {
    pub fn new(api_url: &str, api_key: &str) -> Result<Self, UsageError> {
        let client = Client::builder()
            .user_agent(concat!("sprintbench/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_env(api_url: &str, key_env: &str) -> Result<Self, UsageError> {
        let api_key = std::env::var(key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| UsageError::MissingKey(key_env.to_string()))?;
        Self::new(api_url, &api_key)
    }

    async fn fetch_page(
        &self,
        start: i64,
        end: i64,
        page: Option<&str>,
    ) -> Result<UsagePage, UsageError> {
        let mut query = vec![
            ("start_time", start.to_string()),
            ("end_time", end.to_string()),
            ("bucket_width", "1m".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(page) = page {
            query.push(("page", page.to_string()));
        }

        let resp = self
            .client
            .get(&self.api_url)
            .bearer_auth(&self.api_key)
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UsageError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl UsageSource for OpenAiUsageClient {
    async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageWindow, UsageError> {
        let (start, end) = window_bounds(start, end);
        let mut total = UsageWindow::default();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(start, end, cursor.as_deref()).await?;
            total.add(page.totals());
            match (page.has_more, page.next_page) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        debug!(
            "Usage {}..{}: {} in, {} out over {} requests",
            start, end, total.tokens_in, total.tokens_out, total.requests
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_page_totals() {
        let page: UsagePage = serde_json::from_str(
            r#"{
                "object": "page",
                "data": [
                    {"start_time": 1730419200, "results": [
                        {"input_tokens": 100, "output_tokens": 20, "input_cached_tokens": 40, "num_model_requests": 2}
                    ]},
                    {"start_time": 1730419260, "results": []},
                    {"start_time": 1730419320, "results": [
                        {"input_tokens": 5, "output_tokens": 1, "num_model_requests": 1}
                    ]}
                ],
                "has_more": true,
                "next_page": "page_AAAA"
            }"#,
        )
        .unwrap();

        let totals = page.totals();
        assert_eq!(totals.tokens_in, 105);
        assert_eq!(totals.tokens_out, 21);
        assert_eq!(totals.cached_tokens, 40);
        assert_eq!(totals.requests, 3);
        assert!(page.has_more);
        assert_eq!(page.next_page.as_deref(), Some("page_AAAA"));
    }

    #[test]
    fn test_window_bounds_align_to_minute() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 42).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 12, 3, 5).unwrap();
        let (s, e) = window_bounds(start, end);
        assert_eq!(s % 60, 0);
        assert_eq!(s, start.timestamp() - 42);
        assert_eq!(e, end.timestamp() + 1);
    }

    #[test]
    fn test_missing_key_env() {
        let err = OpenAiUsageClient::from_env(
            "https://example.invalid/usage",
            "SPRINTBENCH_TEST_UNSET_USAGE_KEY",
        )
        .err()
        .unwrap();
        assert!(matches!(err, UsageError::MissingKey(_)));
    }
}
