//! Rate-limited HTTP client for the SAM.gov opportunity search API.

use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "samops-client";

/// Current search endpoint. The `/prod` prefix belongs to a retired
/// deployment and must not be used.
pub const SAM_ENDPOINT: &str = "https://api.sam.gov/opportunities/v2/search";

/// SAM requires `postedFrom`/`postedTo` in this format.
const SAM_DATE_FMT: &str = "%m/%d/%Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff schedule with a bounded attempt budget.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Stretch a delay by a random factor in `[1.0, 1.3)` so synchronized
    /// clients do not retry in lockstep.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let factor = 1.0 + rand::random::<f64>() * 0.3;
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: SAM_ENDPOINT.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Inclusive `[postedFrom, postedTo]` bounds for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, FetchError> {
        if end < start {
            return Err(FetchError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }
}

/// Optional narrowing filters forwarded to the upstream query string.
#[derive(Debug, Clone, Default)]
pub struct PageFilters {
    pub zip: Option<String>,
    pub naics: Option<String>,
    pub set_aside: Option<String>,
}

/// One page of raw notice records plus the upstream total-count hint.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub records: Vec<Value>,
    pub total_records: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("gave up after {attempts} attempts; last status {last_status:?}")]
    RetriesExhausted {
        attempts: usize,
        last_status: Option<u16>,
    },
    #[error("invalid window: {end} is before {start}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug)]
pub struct SamClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl SamClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().context("building reqwest client")?;
        Ok(Self {
            http,
            endpoint: config.endpoint,
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    /// Fetch one page of notices posted inside `window`.
    ///
    /// 429 and 5xx responses are retried with backoff under separate attempt
    /// budgets; any other non-success status fails immediately since it
    /// signals a malformed request rather than a transient condition.
    pub async fn fetch_page(
        &self,
        window: &DateWindow,
        page_size: u32,
        offset: u32,
        filters: &PageFilters,
    ) -> Result<FetchedPage, FetchError> {
        let params = self.build_params(window, page_size, offset, filters);
        let max_attempts = self.backoff.max_attempts;

        let mut attempt = 0usize;
        let mut throttled = 0usize;
        let mut failed = 0usize;

        loop {
            attempt += 1;
            let resp = match self.http.get(&self.endpoint).query(&params).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        failed += 1;
                        if failed >= max_attempts {
                            return Err(FetchError::RetriesExhausted {
                                attempts: attempt,
                                last_status: None,
                            });
                        }
                        let delay =
                            self.backoff.jittered(self.backoff.delay_for_attempt(failed - 1));
                        warn!(error = %err, delay_ms = delay.as_millis() as u64, "transport error, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            };

            let status = resp.status();
            info!(
                status = status.as_u16(),
                attempt,
                max_attempts,
                url = %resp.url(),
                "sam search request"
            );

            if status == StatusCode::TOO_MANY_REQUESTS {
                throttled += 1;
                if throttled >= max_attempts {
                    return Err(FetchError::RetriesExhausted {
                        attempts: attempt,
                        last_status: Some(status.as_u16()),
                    });
                }
                let delay = retry_after(resp.headers())
                    .map(|d| d.min(self.backoff.max_delay))
                    .unwrap_or_else(|| self.backoff.delay_for_attempt(throttled - 1));
                let delay = self.backoff.jittered(delay);
                warn!(delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }

            if status.is_server_error() {
                failed += 1;
                if failed >= max_attempts {
                    return Err(FetchError::RetriesExhausted {
                        attempts: attempt,
                        last_status: Some(status.as_u16()),
                    });
                }
                let delay = self.backoff.jittered(self.backoff.delay_for_attempt(failed - 1));
                warn!(
                    status = status.as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "server error, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body: Value = resp.json().await?;
            return Ok(parse_envelope(&body));
        }
    }

    fn build_params(
        &self,
        window: &DateWindow,
        page_size: u32,
        offset: u32,
        filters: &PageFilters,
    ) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("api_key", self.api_key.clone()),
            ("postedFrom", sam_date(window.start)),
            ("postedTo", sam_date(window.end)),
            ("limit", page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(zip) = &filters.zip {
            params.push(("zipcode", zip.clone()));
        }
        if let Some(naics) = &filters.naics {
            params.push(("naics", naics.clone()));
        }
        if let Some(set_aside) = &filters.set_aside {
            params.push(("setAside", set_aside.clone()));
        }
        params
    }
}

fn sam_date(date: NaiveDate) -> String {
    date.format(SAM_DATE_FMT).to_string()
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs.max(1)))
}

/// Pull the record list and total-count hint out of a search response.
///
/// SAM payloads vary: records may live under `result` or at the root, and
/// both the list key and the total key have shipped under several names.
/// Empty candidate lists are skipped the same way absent ones are.
pub fn parse_envelope(body: &Value) -> FetchedPage {
    let result = match body.get("result") {
        Some(v) if v.is_object() => v,
        _ => body,
    };

    let records = ["opportunitiesData", "searchResults", "data"]
        .iter()
        .find_map(|key| result.get(*key).and_then(Value::as_array))
        .filter(|items| !items.is_empty())
        .cloned()
        .unwrap_or_default();

    let total_records = ["totalRecords", "totalrecords"]
        .iter()
        .find_map(|key| {
            let v = result.get(*key)?;
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
        .unwrap_or(records.len() as u64);

    FetchedPage {
        records,
        total_records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_inside_the_band() {
        let policy = BackoffPolicy::default();
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = policy.jittered(base);
            assert!(jittered >= base);
            assert!(jittered < Duration::from_millis(1300));
        }
    }

    #[test]
    fn window_rejects_inverted_bounds() {
        let start = NaiveDate::from_ymd_opt(2025, 8, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        assert!(matches!(
            DateWindow::new(start, end),
            Err(FetchError::InvalidWindow { .. })
        ));
        assert!(DateWindow::new(start, start).is_ok());
    }

    #[test]
    fn sam_date_uses_upstream_format() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 6).unwrap();
        assert_eq!(sam_date(date), "08/06/2025");
    }

    #[test]
    fn envelope_finds_records_under_result() {
        let page = parse_envelope(&json!({
            "result": {
                "opportunitiesData": [{"noticeId": "a"}, {"noticeId": "b"}],
                "totalRecords": 42,
            }
        }));
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_records, 42);
    }

    #[test]
    fn envelope_falls_back_through_known_keys() {
        let page = parse_envelope(&json!({
            "searchResults": [{"noticeId": "a"}],
            "totalrecords": "7",
        }));
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.total_records, 7);

        let page = parse_envelope(&json!({
            "result": {"opportunitiesData": [], "data": [{"noticeId": "x"}]}
        }));
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.total_records, 1);
    }

    #[test]
    fn envelope_defaults_when_nothing_matches() {
        let page = parse_envelope(&json!({"unexpected": true}));
        assert!(page.records.is_empty());
        assert_eq!(page.total_records, 0);
    }
}
