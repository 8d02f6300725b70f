//! Reader pool.
//!
//! Readers long-poll the durable queue, decode each message back into a
//! datum and feed it to the work queue as a requeued item. The source
//! message is deleted only once a writer has stored the datum, so anything
//! that goes wrong between receive and store ends in a redelivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::datum::Datum;
use crate::queue::{DurableQueue, QueueMessage};
use crate::stats::CollectorStats;
use crate::work_queue::{WorkItem, WorkQueue};

/// Linear backoff between polls.
///
/// Starts at zero, grows by `step` on every `increase` up to `max`, and
/// returns to zero on `reset`.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max: max.max(step),
            current: Duration::ZERO,
        }
    }

    /// Grow the delay and return it.
    pub fn increase(&mut self) -> Duration {
        self.current = (self.current + self.step).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Shared state of the reader pool.
pub(crate) struct Reader {
    pub(crate) queue: Arc<dyn DurableQueue>,
    pub(crate) work_queue: Arc<WorkQueue>,
    pub(crate) stats: Arc<CollectorStats>,
    pub(crate) max_messages: usize,
    pub(crate) read_wait: Duration,
    pub(crate) offer_timeout: Duration,
    pub(crate) throttle_step: Duration,
    pub(crate) sleep_max: Duration,
}

impl Reader {
    /// Reader loop. Returns as soon as `stop` is set, abandoning any poll
    /// or sleep in progress.
    pub(crate) async fn run(self: Arc<Self>, id: usize, mut stop: watch::Receiver<bool>) {
        debug!(reader = id, "Reader started");
        let mut backoff = Backoff::new(self.throttle_step, self.sleep_max);

        loop {
            if *stop.borrow() {
                break;
            }

            // Never fetch more than the work queue can take; with no room the
            // poll is skipped and counts as saturated.
            let batch = self.max_messages.min(self.work_queue.remaining_capacity());
            let (received, saturated) = if batch == 0 {
                (0, true)
            } else {
                let polled = tokio::select! {
                    _ = stop.changed() => break,
                    result = self.queue.receive(batch, self.read_wait) => result,
                };

                match polled {
                    Ok(messages) => {
                        let count = messages.len();
                        let placed_all = self.enqueue(messages).await;
                        (count, !placed_all)
                    }
                    Err(e) => {
                        self.stats.record_read_failure();
                        warn!(reader = id, error = %e, "Durable queue receive failed");
                        (0, false)
                    }
                }
            };

            if received == 0 || saturated {
                let delay = backoff.increase();
                debug!(
                    reader = id,
                    received,
                    saturated,
                    delay_ms = delay.as_millis() as u64,
                    "Reader backing off"
                );
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                backoff.reset();
            }
        }

        debug!(reader = id, "Reader stopped");
    }

    /// Decode and offer each message. Messages that cannot be decoded or
    /// placed stay in the durable queue for redelivery.
    ///
    /// Returns `false` if the work queue stayed full.
    async fn enqueue(&self, messages: Vec<QueueMessage>) -> bool {
        for message in messages {
            let datum = match Datum::from_json(&message.body) {
                Ok(datum) => datum,
                Err(e) => {
                    self.stats.record_read_failure();
                    warn!(receipt = %message.receipt, error = %e, "Undecodable message left in queue");
                    continue;
                }
            };

            let item = WorkItem::requeued(datum, message.receipt);
            match self.work_queue.offer(item, self.offer_timeout).await {
                Ok(()) => self.stats.record_requeued(),
                Err(item) => {
                    debug!(key = %item.key, "Work queue full, leaving message for redelivery");
                    return false;
                }
            }
        }
        true
    }
}
