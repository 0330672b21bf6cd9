//! Fetching response pages from a repository.
//!
//! The state machine only needs "GET this endpoint with these query
//! parameters and give me the body". [`Transport`] is that seam;
//! [`HttpTransport`] is the `reqwest` implementation used by the CLI.
//!
//! Retry strategy of [`HttpTransport`]:
//! - HTTP 429, 503 and other 5xx → retry with exponential backoff
//! - other non-success statuses → fail immediately
//! - network errors → retry
//!
//! A failed fetch is always an error; it is never mistaken for a final page.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::{HarvestError, Result};
use crate::protocol::ListRecordsRequest;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue `request` against `endpoint` and return the response body.
    async fn fetch(&self, endpoint: &str, request: &ListRecordsRequest) -> Result<String>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    max_retries: u32,
    backoff_base: Duration,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_ms),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, endpoint: &str, request: &ListRecordsRequest) -> Result<String> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1x, 2x, 4x, ... the base delay
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            debug!(endpoint, attempt, params = ?request.params(), "fetching page");
            let resp = self
                .client
                .get(endpoint)
                .query(request.params())
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }

                    let body = response.text().await.unwrap_or_default();
                    let message = format!(
                        "HTTP {}: {}",
                        status,
                        body.chars().take(200).collect::<String>()
                    );
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(endpoint, attempt, %status, "retryable response");
                        last_err = Some(HarvestError::transport(endpoint, message));
                        continue;
                    }
                    return Err(HarvestError::transport(endpoint, message));
                }
                Err(e) => {
                    warn!(endpoint, attempt, error = %e, "request failed");
                    last_err = Some(HarvestError::transport(endpoint, e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| HarvestError::transport(endpoint, "request failed")))
    }
}
