//! Delivery of terminal outcomes to the backend.
//!
//! One POST per processed message, pushed through a bounded retry loop and
//! the submit-path circuit breaker. A callback that still fails after the
//! retries is logged and dropped; there is no local durability.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use common::types::OutcomeReport;
use resilience::{retry, BreakerConfig, CircuitBreaker, RetryPolicy};

const SUBMIT_PATH: &str = "/api/v1/relays/messages";
const SUBMIT_ATTEMPTS: u32 = 5;
const SUBMIT_DELAYS_MS: [u64; 4] = [500, 1_000, 2_000, 4_000];
const SUBMIT_JITTER_MS: u64 = 250;
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_OPEN_FOR_MS: u64 = 30_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BackendError {
    /// The request never produced an HTTP status (connect/read failure).
    #[error("backend request failed: {0}")]
    Transport(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend circuit open, retry after {retry_after_ms} ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("backend client init failed: {0}")]
    Init(String),
}

impl BackendError {
    /// Missing status, 5xx, and 429 are transient; a breaker rejection
    /// ends the attempt immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::CircuitOpen { .. } | Self::Init(_) => false,
        }
    }
}

/// Seam between the processor and the backend HTTP surface; tests record
/// reports instead of posting them.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn submit_outcome(&self, report: &OutcomeReport) -> Result<(), BackendError>;
}

pub struct BackendClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
    submit_breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| BackendError::Init(format!("http client init failed: {err}")))?;
        Ok(Self {
            base_url: base_url.into(),
            token: token.into(),
            http,
            submit_breaker: CircuitBreaker::new(BreakerConfig {
                failure_threshold: BREAKER_FAILURE_THRESHOLD,
                open_for_ms: BREAKER_OPEN_FOR_MS,
            }),
            retry: RetryPolicy::new(
                SUBMIT_ATTEMPTS,
                SUBMIT_DELAYS_MS.to_vec(),
                SUBMIT_JITTER_MS,
            ),
        })
    }

    async fn post_once(&self, url: &str, report: &OutcomeReport) -> Result<(), BackendError> {
        self.submit_breaker
            .try_acquire()
            .map_err(|open| BackendError::CircuitOpen {
                retry_after_ms: open.retry_after_ms,
            })?;

        let result = self.send_request(url, report).await;
        match &result {
            Ok(()) => self.submit_breaker.record_success(),
            Err(err) => {
                tracing::warn!("backend submit failed: {err}");
                self.submit_breaker.record_failure();
            }
        }
        result
    }

    async fn send_request(&self, url: &str, report: &OutcomeReport) -> Result<(), BackendError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(report)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl OutcomeSink for BackendClient {
    async fn submit_outcome(&self, report: &OutcomeReport) -> Result<(), BackendError> {
        let url = format!("{}{SUBMIT_PATH}", self.base_url);
        retry(
            &self.retry,
            |err: &BackendError, _attempt| err.is_retryable(),
            |err, attempt| {
                tracing::warn!(
                    attempt,
                    relay_message_id = %report.relay_message_id,
                    "retrying outcome delivery: {err}"
                );
            },
            || self.post_once(&url, report),
        )
        .await
    }
}
