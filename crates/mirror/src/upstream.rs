//! HTTP client for the upstream registry.
//!
//! Two endpoints are used:
//!
//! * `GET {base}/changes?since=..&until=..` returns a [`ChangeBatch`]
//! * `GET {base}/exports/{dataset}` returns `{"rows": [...]}`
//!
//! Rate limiting (429), server errors and transport failures are retried with
//! exponential backoff. Exhausted retries surface as `UpstreamTransient`; any
//! other non-success status or an undecodable body is `Upstream`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use vocabmirror_core::{
    validate_identifier, ChangeBatch, MirrorError, MirrorResult, Record, RegistryConfig,
    UpstreamClient,
};

/// Backoff schedule for retried requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Policy from registry settings.
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_backoff)
    }
}

#[derive(Debug, Deserialize)]
struct ExportResponse {
    rows: Vec<Record>,
}

/// `UpstreamClient` speaking the registry's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HttpRegistryClient {
    /// Create a client from registry settings.
    pub fn new(config: &RegistryConfig) -> MirrorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MirrorError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Replaces the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn changes_url(&self) -> String {
        format!("{}/changes", self.base_url)
    }

    fn export_url(&self, dataset: &str) -> MirrorResult<String> {
        Ok(format!("{}/exports/{}", self.base_url, validate_identifier(dataset)?))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> MirrorResult<T> {
        let mut attempt = 0;
        loop {
            let mut request = self.http.get(url).query(query);
            if let Some(token) = self.token.as_deref() {
                request = request.bearer_auth(token);
            }

            let failure = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| MirrorError::Upstream(format!("invalid response from {url}: {e}")));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if !is_retryable(status) {
                        return Err(MirrorError::Upstream(format!(
                            "GET {url} failed (status={status}): {body}"
                        )));
                    }
                    format!("status={status}: {body}")
                }
                Err(err) => err.to_string(),
            };

            if attempt >= self.retry.max_retries {
                return Err(MirrorError::UpstreamTransient(format!(
                    "GET {url} failed after {} attempts: {failure}",
                    attempt + 1
                )));
            }
            attempt += 1;
            let delay = self.retry.backoff(attempt);
            warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %failure, "registry request failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl UpstreamClient for HttpRegistryClient {
    async fn fetch_changes(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> MirrorResult<ChangeBatch> {
        let query = [
            ("since", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
            ("until", until.to_rfc3339_opts(SecondsFormat::Micros, true)),
        ];
        let batch: ChangeBatch = self.get_json(&self.changes_url(), &query).await?;
        debug!(%since, %until, outcomes = batch.outcomes.len(), "changes fetched");
        Ok(batch)
    }

    async fn fetch_bulk_export(&self, dataset: &str) -> MirrorResult<Vec<Record>> {
        let url = self.export_url(dataset)?;
        let export: ExportResponse = self.get_json(&url, &[]).await?;
        Ok(export.rows)
    }
}
