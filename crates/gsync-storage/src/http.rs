use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only server errors are retried. 429 is left to the caller, which treats it as a block.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts and refused connections are worth another attempt; a body that
/// failed to decode or a redirect loop is not.
pub fn classify_send_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Retry budget for a single page request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Decides what follows failed attempt number `attempt` (zero based).
    /// The wait doubles per attempt up to `max_delay`.
    pub fn decide(&self, disposition: RetryDisposition, attempt: usize) -> RetryDecision {
        if disposition == RetryDisposition::NonRetryable || attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        RetryDecision::Retry {
            delay: self.base_delay.saturating_mul(factor).min(self.max_delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    /// Minimum spacing between two requests on the session.
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            min_request_interval: Duration::from_secs(2),
        }
    }
}

/// Spaces requests so that consecutive calls are at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// One stateful HTTP session (cookie jar included). Not meant to be shared
/// between concurrent callers; drop and rebuild it to start a fresh session.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            pacer: RequestPacer::new(config.min_request_interval),
            retry: config.retry,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        self.pacer.wait().await;
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0;
        loop {
            let error = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse { final_url, body });
                    }
                    HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    }
                }
                Err(err) => HttpError::Request(err),
            };

            let disposition = match &error {
                HttpError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                    .map(classify_status)
                    .unwrap_or(RetryDisposition::NonRetryable),
                HttpError::Request(err) => classify_send_error(err),
            };
            match self.retry.decide(disposition, attempt) {
                RetryDecision::Retry { delay } => {
                    debug!(error = %error, attempt, ?delay, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }
}
