//! Store and queue doubles used by the module tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::datum::{Datum, DatumKey};
use crate::queue::{
    DurableQueue, MemoryQueue, QueueAttributes, QueueError, QueueMessage, Receipt,
};
use crate::store::{DatumStore, MemoryDatumStore, StoreError};

/// Fails (or panics) on every call.
pub(crate) struct FailingStore {
    message: String,
    panic: bool,
    calls: AtomicUsize,
}

impl FailingStore {
    pub(crate) fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            panic: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::new("store exploded")
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatumStore for FailingStore {
    async fn store(&self, _datum: &Datum) -> Result<DatumKey, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("{}", self.message);
        }
        Err(StoreError::Backend(self.message.clone()))
    }
}

/// Sleeps before every write, then stores in memory.
pub(crate) struct SlowStore {
    inner: MemoryDatumStore,
    delay: Duration,
    seen: Mutex<Vec<Datum>>,
    completed: AtomicUsize,
}

impl SlowStore {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryDatumStore::new(),
            delay,
            seen: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    /// Every datum passed to `store`, including calls still sleeping.
    pub(crate) fn seen(&self) -> Vec<Datum> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatumStore for SlowStore {
    async fn store(&self, datum: &Datum) -> Result<DatumKey, StoreError> {
        self.seen.lock().unwrap().push(datum.clone());
        tokio::time::sleep(self.delay).await;
        let key = self.inner.store(datum).await?;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(key)
    }
}

/// Fails the first `failures` calls, then behaves like a memory store.
pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryDatumStore,
    remaining_failures: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(failures: usize) -> Self {
        Self {
            inner: MemoryDatumStore::new(),
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl DatumStore for FlakyStore {
    async fn store(&self, datum: &Datum) -> Result<DatumKey, StoreError> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Backend("backend unavailable".to_string()));
        }
        self.inner.store(datum).await
    }
}

/// Queue whose `send` panics; receives never return anything.
pub(crate) struct PanickingQueue;

#[async_trait]
impl DurableQueue for PanickingQueue {
    async fn send(&self, _body: Vec<u8>) -> Result<(), QueueError> {
        panic!("queue send exploded");
    }

    async fn receive(
        &self,
        _max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        tokio::time::sleep(wait).await;
        Ok(Vec::new())
    }

    async fn delete(&self, _receipt: &Receipt) -> Result<(), QueueError> {
        Ok(())
    }

    async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        Ok(QueueAttributes::default())
    }
}

/// Queue whose `attributes` call never answers within a health check.
pub(crate) struct StalledQueue;

#[async_trait]
impl DurableQueue for StalledQueue {
    async fn send(&self, _body: Vec<u8>) -> Result<(), QueueError> {
        Ok(())
    }

    async fn receive(
        &self,
        _max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        tokio::time::sleep(wait).await;
        Ok(Vec::new())
    }

    async fn delete(&self, _receipt: &Receipt) -> Result<(), QueueError> {
        Ok(())
    }

    async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(QueueAttributes::default())
    }
}

/// One completed `receive` call seen by a [`RecordingQueue`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Poll {
    pub(crate) started: Instant,
    pub(crate) requested: usize,
    pub(crate) received: usize,
}

/// Memory queue that records every completed receive.
pub(crate) struct RecordingQueue {
    pub(crate) inner: MemoryQueue,
    polls: Mutex<Vec<Poll>>,
}

impl RecordingQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryQueue::new(),
            polls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn polls(&self) -> Vec<Poll> {
        self.polls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DurableQueue for RecordingQueue {
    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError> {
        self.inner.send(body).await
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let started = Instant::now();
        let messages = self.inner.receive(max_messages, wait).await?;
        self.polls.lock().unwrap().push(Poll {
            started,
            requested: max_messages,
            received: messages.len(),
        });
        Ok(messages)
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        self.inner.delete(receipt).await
    }

    async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        self.inner.attributes().await
    }
}
