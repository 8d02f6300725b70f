//! Bounded in-process work queue.
//!
//! Producers, writers and readers share one queue. It wraps a tokio mpsc
//! channel; the receiver sits behind an async mutex so any number of writers
//! can `take` from it. Every operation is bounded by an explicit timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::datum::{Datum, DatumKey};
use crate::queue::Receipt;

/// Where a work item came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Accepted from a producer `store` call
    Direct,

    /// Replayed from the durable queue; the receipt acknowledges the source
    /// message once the datum is stored
    Requeued { receipt: Receipt },
}

/// A datum waiting to be written.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub datum: Arc<Datum>,
    pub key: DatumKey,
    pub enqueued_at: Instant,
    pub origin: Origin,
}

impl WorkItem {
    pub fn direct(datum: Datum) -> Self {
        Self::with_origin(datum, Origin::Direct)
    }

    pub fn requeued(datum: Datum, receipt: Receipt) -> Self {
        Self::with_origin(datum, Origin::Requeued { receipt })
    }

    fn with_origin(datum: Datum, origin: Origin) -> Self {
        Self {
            key: datum.key(),
            datum: Arc::new(datum),
            enqueued_at: Instant::now(),
            origin,
        }
    }

    /// Receipt of the source message, for requeued items.
    pub fn receipt(&self) -> Option<&Receipt> {
        match &self.origin {
            Origin::Direct => None,
            Origin::Requeued { receipt } => Some(receipt),
        }
    }
}

/// Bounded FIFO of work items.
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    rx: Mutex<mpsc::Receiver<WorkItem>>,
    capacity: usize,
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` items (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    /// Enqueue `item`, waiting up to `wait` for room.
    ///
    /// Hands the item back if the queue stayed full.
    pub async fn offer(&self, item: WorkItem, wait: Duration) -> Result<(), WorkItem> {
        if wait.is_zero() {
            return self.tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(item) => item,
                mpsc::error::TrySendError::Closed(item) => item,
            });
        }

        self.tx.send_timeout(item, wait).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(item) => item,
            mpsc::error::SendTimeoutError::Closed(item) => item,
        })
    }

    /// Dequeue the next item, waiting up to `wait`.
    pub async fn take(&self, wait: Duration) -> Option<WorkItem> {
        timeout(wait, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    /// Remove and return everything currently queued.
    pub async fn drain(&self) -> Vec<WorkItem> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate free slots.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::StreamDatum;
    use chrono::Utc;
    use uuid::Uuid;

    fn item() -> WorkItem {
        WorkItem::direct(StreamDatum::new(Uuid::new_v4(), Utc::now()).into())
    }

    #[tokio::test]
    async fn test_offer_and_take_fifo() {
        let queue = WorkQueue::new(4);
        let first = item();
        let second = item();

        queue.offer(first.clone(), Duration::ZERO).await.unwrap();
        queue.offer(second.clone(), Duration::ZERO).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remaining_capacity(), 2);

        let taken = queue.take(Duration::from_millis(10)).await.unwrap();
        assert_eq!(taken.key, first.key);
        let taken = queue.take(Duration::from_millis(10)).await.unwrap();
        assert_eq!(taken.key, second.key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_offer_returns_item_when_full() {
        let queue = WorkQueue::new(1);
        queue.offer(item(), Duration::ZERO).await.unwrap();

        let rejected = item();
        let key = rejected.key.clone();
        let result = queue.offer(rejected, Duration::from_millis(20)).await;

        assert_eq!(result.unwrap_err().key, key);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_offer_waits_for_room() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.offer(item(), Duration::ZERO).await.unwrap();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.take(Duration::from_millis(10)).await
            })
        };

        let result = queue.offer(item(), Duration::from_secs(1)).await;
        assert!(result.is_ok());
        assert!(consumer.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_take_times_out_when_empty() {
        let queue = WorkQueue::new(2);
        assert!(queue.take(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_takers_share_items() {
        let queue = Arc::new(WorkQueue::new(16));
        for _ in 0..10 {
            queue.offer(item(), Duration::ZERO).await.unwrap();
        }

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut taken = 0;
                    while queue.take(Duration::from_millis(20)).await.is_some() {
                        taken += 1;
                    }
                    taken
                })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_drain_empties_queue() {
        let queue = WorkQueue::new(8);
        for _ in 0..3 {
            queue.offer(item(), Duration::ZERO).await.unwrap();
        }

        assert_eq!(queue.drain().await.len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeued_item_carries_receipt() {
        let datum = StreamDatum::new(Uuid::new_v4(), Utc::now());
        let item = WorkItem::requeued(datum.into(), Receipt::new("r-9"));

        assert_eq!(item.receipt(), Some(&Receipt::new("r-9")));
        assert!(WorkItem::direct(StreamDatum::new(Uuid::new_v4(), Utc::now()).into())
            .receipt()
            .is_none());
    }
}
