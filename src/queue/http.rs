//! Remote durable queue over HTTP.
//!
//! The queue service exposes a small REST surface:
//!
//! - `POST   {base}/messages`: enqueue a JSON body
//! - `GET    {base}/messages?max=N&waitSeconds=S`: long-poll for messages
//! - `DELETE {base}/messages/{receipt}`: acknowledge a message
//! - `GET    {base}/attributes`: approximate depth and in-flight counts
//!
//! Sends and deletes retry with exponential backoff and jitter; receives do
//! not, since the reader pool applies its own backoff.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, error, warn};

use super::{DurableQueue, QueueAttributes, QueueError, QueueMessage, Receipt};
use crate::config::Config;

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 200;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    receipt: String,
    body: String,
}

/// HTTP client for a remote durable queue.
pub struct HttpQueue {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Base URL of the queue, without trailing slash
    base_url: String,

    /// Maximum number of retry attempts for sends and deletes
    max_retries: u32,

    /// Request timeout, added to the long-poll wait for receives
    timeout: Duration,
}

impl HttpQueue {
    /// Create a queue client from service configuration.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` if no queue URL is configured or the HTTP
    /// client cannot be built.
    pub fn new(config: &Config) -> Result<Self, QueueError> {
        let url = config
            .queue_url
            .as_deref()
            .ok_or_else(|| QueueError::Config("queue URL is not configured".to_string()))?;

        Self::with_settings(url, config.request_timeout, config.max_retries)
    }

    /// Create a queue client with explicit settings.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Queue base URL; a trailing slash is ignored
    /// * `timeout` - Per-request timeout, added to the long-poll wait on receives
    /// * `max_retries` - Retry attempts for sends and deletes after the first try
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` if the HTTP client cannot be built.
    pub fn with_settings(
        base_url: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, QueueError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| QueueError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries,
            timeout,
        })
    }

    /// Base URL of the queue, without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Retry attempts allowed after the first try of a send or delete.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    /// URL of one received message. The receipt is opaque and may hold
    /// `/`, `#` or `?`, so it is pushed as a single encoded path segment.
    fn message_url(&self, receipt: &Receipt) -> Result<Url, QueueError> {
        let mut url = Url::parse(&self.messages_url())
            .map_err(|e| QueueError::Config(format!("invalid queue URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| QueueError::Config(format!("queue URL cannot take a path: {}", self.base_url)))?
            .push(receipt.as_str());
        Ok(url)
    }

    fn attributes_url(&self) -> String {
        format!("{}/attributes", self.base_url)
    }

    /// Run `request` up to `max_retries + 1` times, backing off between
    /// retryable failures.
    async fn with_retries<T, F, Fut>(&self, operation: &str, mut request: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut last_error: Option<QueueError> = None;
        let mut attempt = 0;

        while attempt <= self.max_retries {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt);
                warn!(
                    operation,
                    attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying queue request after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match request().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retryable = Self::is_retryable_error(&e);
                    if retryable && attempt < self.max_retries {
                        warn!(operation, error = %e, attempt = attempt + 1, "Queue request failed, will retry");
                        last_error = Some(e);
                        attempt += 1;
                    } else {
                        error!(
                            operation,
                            error = %e,
                            attempts = attempt + 1,
                            retryable,
                            "Queue request failed permanently"
                        );
                        return Err(e);
                    }
                }
            }
        }

        Err(QueueError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
    }

    /// Exponential backoff with up to 25% jitter, capped at the maximum delay.
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponential_delay = DEFAULT_BASE_DELAY_MS.saturating_mul(1 << attempt.min(10));
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);
        let total_delay = exponential_delay
            .saturating_add(jitter)
            .min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }

    fn is_retryable_error(error: &QueueError) -> bool {
        match error {
            QueueError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            QueueError::Timeout => true,
            QueueError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, QueueError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(QueueError::Status {
                code: status,
                message,
            })
        }
    }
}

#[async_trait]
impl DurableQueue for HttpQueue {
    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError> {
        debug!(bytes = body.len(), url = %self.base_url, "Sending queue message");

        self.with_retries("send", || async {
            let response = self
                .client
                .post(self.messages_url())
                .timeout(self.timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await?;
            Self::check_status(response).await.map(|_| ())
        })
        .await
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let response = self
            .client
            .get(self.messages_url())
            .timeout(wait + self.timeout)
            .query(&[
                ("max", max_messages.to_string()),
                ("waitSeconds", wait.as_secs().to_string()),
            ])
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let text = response.text().await?;
        let parsed: ReceiveResponse =
            serde_json::from_str(&text).map_err(|e| QueueError::Parse(e.to_string()))?;

        Ok(parsed
            .messages
            .into_iter()
            .map(|m| QueueMessage {
                body: m.body.into_bytes(),
                receipt: Receipt::new(m.receipt),
            })
            .collect())
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let url = self.message_url(receipt)?;

        self.with_retries("delete", || async {
            let response = self
                .client
                .delete(url.clone())
                .timeout(self.timeout)
                .send()
                .await?;
            Self::check_status(response).await.map(|_| ())
        })
        .await
    }

    async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        let response = self
            .client
            .get(self.attributes_url())
            .timeout(self.timeout)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| QueueError::Parse(e.to_string()))
    }
}
