//! Writer pool.
//!
//! Each writer takes items from the work queue and hands them to the backing
//! store on a separate task, waiting at most `work_item_max_wait`. A write
//! that fails or runs long is overflowed to the durable queue so one slow
//! write never holds up the pool. Late writes are left to finish on their
//! own; the store's upsert semantics absorb the resulting duplicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::datum::DatumKey;
use crate::error::{panic_message, CollectorError, FaultReporter};
use crate::queue::{DurableQueue, QueueError, Receipt};
use crate::stats::CollectorStats;
use crate::store::{DatumStore, StoreError};
use crate::work_queue::{WorkItem, WorkQueue};

/// How long an idle writer waits on the work queue before rechecking its
/// stop signal.
const TAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Path from a work item to the durable queue.
#[derive(Clone)]
pub(crate) struct Overflow {
    queue: Arc<dyn DurableQueue>,
    stats: Arc<CollectorStats>,
    faults: FaultReporter,
}

impl Overflow {
    pub(crate) fn new(
        queue: Arc<dyn DurableQueue>,
        stats: Arc<CollectorStats>,
        faults: FaultReporter,
    ) -> Self {
        Self {
            queue,
            stats,
            faults,
        }
    }

    /// Send the item's datum to the durable queue as a new message.
    ///
    /// Returns `false` if the datum could not be sent; the failure has
    /// already been counted, logged and reported.
    pub(crate) async fn send(&self, item: &WorkItem) -> bool {
        let result = match item.datum.to_json() {
            Ok(body) => self.queue.send(body).await,
            Err(e) => Err(QueueError::Encode(e)),
        };

        match result {
            Ok(()) => {
                debug!(key = %item.key, "Datum overflowed to durable queue");
                true
            }
            Err(e) => {
                self.stats.record_overflow_failure();
                error!(key = %item.key, error = %e, "Failed to overflow datum, data at risk");
                self.faults.report(CollectorError::Overflow(e));
                false
            }
        }
    }

    /// Delete a replayed message whose datum is now stored.
    pub(crate) async fn acknowledge(&self, receipt: &Receipt) {
        if let Err(e) = self.queue.delete(receipt).await {
            warn!(%receipt, error = %e, "Failed to delete stored message; it will be redelivered");
        }
    }
}

/// Items writers are working on, by datum key.
#[derive(Default)]
pub(crate) struct InFlightItems {
    items: Mutex<HashMap<u64, DatumKey>>,
    next_id: AtomicU64,
}

impl InFlightItems {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, DatumKey>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, key: DatumKey) -> InFlight<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, key);
        InFlight { items: self, id }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn keys(&self) -> Vec<DatumKey> {
        self.lock().values().cloned().collect()
    }
}

/// Registration of one in-flight item, removed on drop.
struct InFlight<'a> {
    items: &'a InFlightItems,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.items.lock().remove(&self.id);
    }
}

type StoreCall = JoinHandle<Result<DatumKey, StoreError>>;

/// Shared state of the writer pool.
pub(crate) struct Writer {
    pub(crate) work_queue: Arc<WorkQueue>,
    pub(crate) store: Arc<dyn DatumStore>,
    pub(crate) overflow: Overflow,
    pub(crate) stats: Arc<CollectorStats>,
    pub(crate) faults: FaultReporter,
    pub(crate) in_flight: Arc<InFlightItems>,
    pub(crate) max_wait: Duration,
}

impl Writer {
    /// Writer loop. Exits once `stop` is set and the work queue is empty.
    pub(crate) async fn run(self: Arc<Self>, id: usize, stop: watch::Receiver<bool>) {
        debug!(writer = id, "Writer started");

        loop {
            match self.work_queue.take(TAKE_POLL_INTERVAL).await {
                Some(item) => self.process(item).await,
                None => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(writer = id, "Writer stopped");
    }

    pub(crate) async fn process(&self, item: WorkItem) {
        let _in_flight = self.in_flight.enter(item.key.clone());

        let store = self.store.clone();
        let datum = item.datum.clone();
        let mut call: StoreCall = tokio::spawn(async move { store.store(&datum).await });

        match timeout(self.max_wait, &mut call).await {
            Ok(Ok(Ok(_))) => self.on_stored(&item).await,
            Ok(Ok(Err(e))) => self.on_store_error(&item, e).await,
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic().as_ref())
                } else {
                    "store task cancelled".to_string()
                };
                self.on_store_error(&item, StoreError::Panicked(message))
                    .await
            }
            Err(_) => {
                self.stats.record_overflowed_on_timeout();
                warn!(
                    key = %item.key,
                    max_wait_ms = self.max_wait.as_millis() as u64,
                    "Store exceeded wait budget, overflowing datum"
                );
                self.overflow.send(&item).await;
                self.watch_late_completion(item.key.clone(), call);
            }
        }
    }

    async fn on_stored(&self, item: &WorkItem) {
        self.stats.record_stored();
        debug!(
            key = %item.key,
            latency_ms = item.enqueued_at.elapsed().as_millis() as u64,
            "Datum stored"
        );

        if let Some(receipt) = item.receipt() {
            self.overflow.acknowledge(receipt).await;
        }
    }

    async fn on_store_error(&self, item: &WorkItem, error: StoreError) {
        self.stats.record_overflowed_on_error();
        warn!(key = %item.key, error = %error, "Store failed, overflowing datum");

        // A requeued item's source message stays; the overflow message or a
        // redelivery of the original will be stored later.
        self.overflow.send(item).await;
        self.faults.report(CollectorError::Store(error));
    }

    fn watch_late_completion(&self, key: DatumKey, call: StoreCall) {
        let stats = self.stats.clone();

        tokio::spawn(async move {
            match call.await {
                Ok(Ok(_)) => {
                    stats.record_completed_after_timeout();
                    debug!(%key, "Timed-out store completed in background");
                }
                Ok(Err(e)) => debug!(%key, error = %e, "Timed-out store failed in background"),
                Err(e) => debug!(%key, error = %e, "Timed-out store task did not complete"),
            }
        });
    }
}
