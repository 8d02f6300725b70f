//! Durable queue port and its implementations.
//!
//! The collector overflows datum it cannot store in time to a
//! [`DurableQueue`], and its reader pool replays messages from the same
//! queue. Delivery is at-least-once: a received message that is not deleted
//! becomes visible again after a visibility timeout.
//!
//! - [`HttpQueue`]: remote queue over HTTP
//! - [`DiskQueue`]: local heap + disk overflow medium that survives restart
//! - [`MemoryQueue`]: in-process queue

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod disk;
pub mod http;
mod inbox;
mod lock_pool;

pub use disk::DiskQueue;
pub use http::HttpQueue;
pub use lock_pool::{KeyLockGuard, KeyLockPool};

use inbox::Inbox;

/// Default time a received message stays hidden before redelivery.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque delete token for a received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message received from a durable queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: Vec<u8>,
    pub receipt: Receipt,
}

/// Approximate queue backlog figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueAttributes {
    /// Messages waiting to be received
    pub approximate_depth: u64,

    /// Messages received but not yet deleted
    pub approximate_in_flight: u64,
}

/// Errors raised by durable queue implementations.
#[derive(Debug)]
pub enum QueueError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Queue service returned an error status code
    Status {
        code: reqwest::StatusCode,
        message: String,
    },

    /// Failed to parse a queue service response
    Parse(String),

    /// All retry attempts exhausted
    RetriesExhausted { attempts: u32, last_error: String },

    /// Request timed out
    Timeout,

    /// Local spool I/O failed
    Io(std::io::Error),

    /// Datum could not be encoded as a message body
    Encode(serde_json::Error),

    /// Receipt is not one this queue issued
    InvalidReceipt(String),

    /// Queue configuration error
    Config(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Request(e) => write!(f, "Queue request failed: {}", e),
            QueueError::Status { code, message } => {
                write!(f, "Queue service error ({}): {}", code, message)
            }
            QueueError::Parse(e) => write!(f, "Failed to parse queue response: {}", e),
            QueueError::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "All {} retry attempts exhausted. Last error: {}",
                attempts, last_error
            ),
            QueueError::Timeout => write!(f, "Queue request timed out"),
            QueueError::Io(e) => write!(f, "Queue spool I/O error: {}", e),
            QueueError::Encode(e) => write!(f, "Failed to encode message: {}", e),
            QueueError::InvalidReceipt(r) => write!(f, "Invalid receipt: {}", r),
            QueueError::Config(e) => write!(f, "Queue configuration error: {}", e),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Request(e) => Some(e),
            QueueError::Io(e) => Some(e),
            QueueError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for QueueError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            QueueError::Timeout
        } else {
            QueueError::Request(err)
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err)
    }
}

/// Durable, at-least-once message queue.
///
/// Implementations must tolerate concurrent use by every reader and writer
/// of a collector.
#[async_trait]
pub trait DurableQueue: Send + Sync + 'static {
    /// Enqueue a message body.
    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError>;

    /// Receive up to `max_messages`, waiting up to `wait` for at least one.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a received message so it is not redelivered.
    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Approximate backlog figures.
    async fn attributes(&self) -> Result<QueueAttributes, QueueError>;
}

/// In-process durable queue.
///
/// Not durable across restarts; keeps a log of every sent body, which makes
/// it useful for producer-only deployments and for inspecting overflow.
pub struct MemoryQueue {
    inbox: Inbox,
    sent: std::sync::Mutex<Vec<Vec<u8>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility: Duration) -> Self {
        Self {
            inbox: Inbox::new(visibility),
            sent: std::sync::Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Every body passed to `send`, in order.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or_default()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(body.clone());
        }
        self.inbox.push(id.to_string(), body);
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        Ok(self.inbox.receive(max_messages, wait).await)
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let (id, generation) = inbox::parse_receipt(receipt)?;
        self.inbox.remove(&id, generation);
        Ok(())
    }

    async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        Ok(self.inbox.attributes())
    }
}
