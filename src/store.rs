//! Backing store port.
//!
//! The collector persists datum through a [`DatumStore`]. Implementations
//! must treat every call as an idempotent upsert keyed by [`DatumKey`]: the
//! collector may deliver the same datum more than once, from different
//! paths, in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::datum::{Datum, DatumKey};

/// Errors returned by a backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store rejected or failed the write
    Backend(String),

    /// The store task panicked
    Panicked(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{}", message),
            StoreError::Panicked(message) => write!(f, "store task panicked: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistent datum storage.
///
/// Must be safe to call concurrently from every writer task. Calls may be
/// slow; the collector bounds how long it waits but never cancels them.
#[async_trait]
pub trait DatumStore: Send + Sync + 'static {
    async fn store(&self, datum: &Datum) -> Result<DatumKey, StoreError>;
}

/// In-memory upsert store, last write wins.
#[derive(Default)]
pub struct MemoryDatumStore {
    rows: RwLock<HashMap<DatumKey, Datum>>,
    writes: AtomicU64,
    latency: Duration,
}

impl MemoryDatumStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that sleeps `latency` before every write.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &DatumKey) -> Option<Datum> {
        self.rows.read().ok().and_then(|rows| rows.get(key).cloned())
    }

    /// Number of distinct keys stored.
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `store` calls that completed, duplicates included.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DatumStore for MemoryDatumStore {
    async fn store(&self, datum: &Datum) -> Result<DatumKey, StoreError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let key = datum.key();
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        let replaced = rows.insert(key.clone(), datum.clone()).is_some();
        drop(rows);

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(%key, replaced, "Stored datum");
        Ok(key)
    }
}
