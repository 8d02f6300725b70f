//! Collector facade.
//!
//! [`DatumCollector`] composes the work queue, the writer and reader pools
//! and the durable queue behind a small surface: `store`, `start`,
//! `shutdown_and_wait`, `health_check` and `stats`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::CollectorOptions;
use crate::datum::{Datum, DatumKey};
use crate::error::{panic_message, CollectorError, ExceptionHandler, FaultReporter};
use crate::queue::{DurableQueue, QueueAttributes};
use crate::reader::Reader;
use crate::stats::{CollectorStats, StatsSnapshot};
use crate::store::DatumStore;
use crate::work_queue::{WorkItem, WorkQueue};
use crate::writer::{InFlightItems, Overflow, Writer};

/// Time allowed for the remote attributes call in a health check.
pub const HEALTH_CHECK_BUDGET: Duration = Duration::from_millis(250);

/// Point-in-time view of collector health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub work_queue_depth: usize,
    pub work_queue_capacity: usize,
    pub writer_in_flight: usize,

    /// Remote backlog; `None` until a health check has reached the queue
    pub approximate_queue_depth: Option<u64>,
    pub approximate_in_flight: Option<u64>,

    /// Remote figures come from an earlier check
    pub remote_stale: bool,

    pub accepting: bool,
    pub stats: StatsSnapshot,
}

impl HealthSnapshot {
    /// Named integer properties for liveness and readiness checks.
    pub fn properties(&self) -> Vec<(&'static str, u64)> {
        let mut properties = Vec::with_capacity(14);
        if let Some(depth) = self.approximate_queue_depth {
            properties.push(("approximateQueueDepth", depth));
        }
        if let Some(in_flight) = self.approximate_in_flight {
            properties.push(("approximateInFlight", in_flight));
        }
        properties.push(("workQueueDepth", self.work_queue_depth as u64));
        properties.push(("writerInFlight", self.writer_in_flight as u64));
        properties.extend(self.stats.named());
        properties
    }
}

/// Outcome of [`DatumCollector::shutdown_and_wait`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Items still in the work queue when shutdown finished
    pub dropped: u64,

    /// Keys of the datum writers were still storing when the deadline
    /// passed. Each was logged at `error!`; none is known to be stored.
    pub abandoned_in_flight: Vec<DatumKey>,

    /// Workers were still running at the deadline and were aborted
    pub timed_out: bool,
}

impl ShutdownReport {
    /// True when every worker finished in time and nothing was dropped.
    pub fn is_clean(&self) -> bool {
        self.dropped == 0 && !self.timed_out
    }
}

struct Worker {
    name: String,
    supervisor: JoinHandle<()>,
    abort: AbortHandle,
}

struct Workers {
    writer_stop: watch::Sender<bool>,
    reader_stop: watch::Sender<bool>,
    writers: Vec<Worker>,
    readers: Vec<Worker>,
}

enum Lifecycle {
    Idle,
    Running(Workers),
    Stopped,
}

/// Asynchronous durable datum collector.
pub struct DatumCollector {
    options: CollectorOptions,
    store: Arc<dyn DatumStore>,
    queue: Arc<dyn DurableQueue>,
    work_queue: Arc<WorkQueue>,
    stats: Arc<CollectorStats>,
    faults: FaultReporter,
    overflow: Overflow,
    writer_in_flight: Arc<InFlightItems>,
    accepting: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    last_remote: Mutex<Option<QueueAttributes>>,
}

impl DatumCollector {
    pub fn new(
        options: CollectorOptions,
        store: Arc<dyn DatumStore>,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        let stats = Arc::new(CollectorStats::new());
        let faults = FaultReporter::default();
        let overflow = Overflow::new(queue.clone(), stats.clone(), faults.clone());

        Self {
            work_queue: Arc::new(WorkQueue::new(options.work_queue_capacity)),
            options,
            store,
            queue,
            stats,
            faults,
            overflow,
            writer_in_flight: Arc::new(InFlightItems::default()),
            accepting: AtomicBool::new(true),
            lifecycle: Mutex::new(Lifecycle::Idle),
            last_remote: Mutex::new(None),
        }
    }

    /// Replace the handler that receives store, overflow and worker faults.
    pub fn set_exception_handler(&self, handler: ExceptionHandler) {
        self.faults.set(handler);
    }

    /// Spawn the writer and reader pools.
    ///
    /// Must be called from within a tokio runtime. A collector starts once.
    pub fn start(&self) -> Result<(), CollectorError> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(CollectorError::AlreadyStarted);
        }

        let (writer_stop, writer_rx) = watch::channel(false);
        let (reader_stop, reader_rx) = watch::channel(false);

        let writer = Arc::new(Writer {
            work_queue: self.work_queue.clone(),
            store: self.store.clone(),
            overflow: self.overflow.clone(),
            stats: self.stats.clone(),
            faults: self.faults.clone(),
            in_flight: self.writer_in_flight.clone(),
            max_wait: self.options.work_item_max_wait,
        });
        let writers = (0..self.options.write_concurrency)
            .map(|id| {
                self.supervise(
                    format!("writer-{}", id),
                    writer.clone().run(id, writer_rx.clone()),
                )
            })
            .collect();

        let reader = Arc::new(Reader {
            queue: self.queue.clone(),
            work_queue: self.work_queue.clone(),
            stats: self.stats.clone(),
            max_messages: self.options.read_max_message_count,
            read_wait: self.options.read_wait,
            offer_timeout: self.options.offer_timeout,
            throttle_step: self.options.read_sleep_throttle_step,
            sleep_max: self.options.read_sleep_max,
        });
        let readers = (0..self.options.read_concurrency)
            .map(|id| {
                self.supervise(
                    format!("reader-{}", id),
                    reader.clone().run(id, reader_rx.clone()),
                )
            })
            .collect();

        *lifecycle = Lifecycle::Running(Workers {
            writer_stop,
            reader_stop,
            writers,
            readers,
        });

        info!(
            writers = self.options.write_concurrency,
            readers = self.options.read_concurrency,
            capacity = self.work_queue.capacity(),
            "Datum collector started"
        );
        Ok(())
    }

    /// Run `task` on its own tokio task, routing a panic to the exception
    /// handler.
    fn supervise<F>(&self, name: String, task: F) -> Worker
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = tokio::spawn(task);
        let abort = inner.abort_handle();
        let faults = self.faults.clone();
        let worker = name.clone();

        let supervisor = tokio::spawn(async move {
            match inner.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic().as_ref());
                    error!(worker = %worker, %message, "Worker panicked");
                    faults.report(CollectorError::WorkerPanic { worker, message });
                }
                Err(_) => debug!(worker = %worker, "Worker aborted"),
            }
        });

        Worker {
            name,
            supervisor,
            abort,
        }
    }

    /// Accept a datum for storage and return its key.
    ///
    /// Never waits on the backing store. When the work queue stays full for
    /// `offer_timeout`, or the collector is shutting down, the datum goes
    /// straight to the durable queue.
    pub async fn store(&self, datum: impl Into<Datum>) -> DatumKey {
        let item = WorkItem::direct(datum.into());
        let key = item.key.clone();
        self.stats.record_received();

        if !self.accepting.load(Ordering::Acquire) {
            debug!(%key, "Collector shutting down, overflowing datum");
            self.overflow.send(&item).await;
            return key;
        }

        if let Err(item) = self.work_queue.offer(item, self.options.offer_timeout).await {
            self.stats.record_queue_full_overflow();
            warn!(%key, "Work queue full, overflowing datum");
            self.overflow.send(&item).await;
        }

        key
    }

    /// Stop accepting work, let writers drain the work queue, and wait up to
    /// `max_wait` for every worker to exit.
    ///
    /// Workers still running at the deadline are aborted. Backing store
    /// calls already in progress run to completion on their own tasks.
    pub async fn shutdown_and_wait(&self, max_wait: Duration) -> ShutdownReport {
        let deadline = Instant::now() + max_wait;
        self.accepting.store(false, Ordering::Release);

        let workers = {
            let mut lifecycle = self
                .lifecycle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(workers) => Some(workers),
                _ => None,
            }
        };

        let mut report = ShutdownReport::default();

        if let Some(mut workers) = workers {
            info!(
                queued = self.work_queue.len(),
                max_wait_secs = max_wait.as_secs_f64(),
                "Shutting down datum collector"
            );
            let _ = workers.reader_stop.send(true);
            let _ = workers.writer_stop.send(true);

            for worker in workers.readers.iter_mut().chain(workers.writers.iter_mut()) {
                if timeout_at(deadline, &mut worker.supervisor).await.is_err() {
                    warn!(worker = %worker.name, "Worker still running at shutdown deadline");
                    report.timed_out = true;
                    break;
                }
            }

            if report.timed_out {
                report.abandoned_in_flight = self.writer_in_flight.keys();
                for key in &report.abandoned_in_flight {
                    error!(%key, "Abandoning datum still being stored at shutdown deadline, data at risk");
                }
                for worker in workers.readers.iter().chain(workers.writers.iter()) {
                    worker.abort.abort();
                }
            }
        }

        let dropped = self.work_queue.drain().await;
        for item in &dropped {
            error!(key = %item.key, "Dropping datum still queued at shutdown");
        }
        report.dropped = dropped.len() as u64;
        self.stats.record_dropped_on_shutdown(report.dropped);

        if report.is_clean() {
            info!("Datum collector stopped");
        } else {
            error!(
                dropped = report.dropped,
                abandoned_in_flight = report.abandoned_in_flight.len(),
                timed_out = report.timed_out,
                "Datum collector stopped with datum at risk"
            );
        }
        report
    }

    /// Collect health figures, spending at most [`HEALTH_CHECK_BUDGET`] on
    /// the durable queue.
    pub async fn health_check(&self) -> HealthSnapshot {
        let fresh = match timeout(HEALTH_CHECK_BUDGET, self.queue.attributes()).await {
            Ok(Ok(attributes)) => Some(attributes),
            Ok(Err(e)) => {
                warn!(error = %e, "Durable queue attributes unavailable");
                None
            }
            Err(_) => {
                warn!(
                    budget_ms = HEALTH_CHECK_BUDGET.as_millis() as u64,
                    "Durable queue attributes timed out"
                );
                None
            }
        };

        let remote = {
            let mut last = self
                .last_remote
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if fresh.is_some() {
                *last = fresh;
            }
            *last
        };

        HealthSnapshot {
            work_queue_depth: self.work_queue.len(),
            work_queue_capacity: self.work_queue.capacity(),
            writer_in_flight: self.writer_in_flight.len(),
            approximate_queue_depth: remote.map(|a| a.approximate_depth),
            approximate_in_flight: remote.map(|a| a.approximate_in_flight),
            remote_stale: fresh.is_none(),
            accepting: self.accepting.load(Ordering::Acquire),
            stats: self.stats.snapshot(),
        }
    }

    /// Shared counters, live for the life of the collector.
    pub fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }

    /// Options the collector was built with.
    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    /// Number of items waiting in the work queue for a writer.
    pub fn work_queue_len(&self) -> usize {
        self.work_queue.len()
    }
}
