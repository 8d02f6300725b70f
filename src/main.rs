//! Datum Collector - durable time-series ingestion service
//!
//! Runs a `DatumCollector` against an in-memory backing store, fed by the
//! synthetic reading generator. Datum the store cannot take in time overflow
//! to a durable queue and are replayed by the reader pool.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `DATUM_COLLECTOR_QUEUE_URL`: Remote queue base URL (selects the HTTP queue)
//! - `DATUM_COLLECTOR_SPOOL_DIR`: Local spool directory (selects the disk queue)
//! - `DATUM_COLLECTOR_WRITE_CONCURRENCY`: Writer tasks (default: 2)
//! - `DATUM_COLLECTOR_READ_CONCURRENCY`: Reader tasks (default: 0)
//! - `DATUM_COLLECTOR_WORK_ITEM_MAX_WAIT_MS`: Per-item store budget (default: 1000)
//! - `DATUM_COLLECTOR_SHUTDOWN_WAIT_SECS`: Drain deadline (default: 30)
//! - `DATUM_COLLECTOR_PRODUCER_INTERVAL_MS`: Generator interval (default: 50)
//! - `DATUM_COLLECTOR_SIM_STORE_LATENCY_MS`: Simulated store latency (default: 0)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! With neither a queue URL nor a spool directory the collector overflows to
//! an in-process queue, which does not survive a restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use datum_collector::config::Config;
use datum_collector::queue::{DiskQueue, DurableQueue, HttpQueue, MemoryQueue};
use datum_collector::simulator::ReadingGenerator;
use datum_collector::store::MemoryDatumStore;
use datum_collector::{CollectorError, DatumCollector};

/// Interval between health snapshots in the log
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Datum Collector service...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                write_concurrency = config.options.write_concurrency,
                read_concurrency = config.options.read_concurrency,
                work_queue_capacity = config.options.work_queue_capacity,
                max_wait_ms = config.options.work_item_max_wait.as_millis() as u64,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let queue = match build_queue(&config).await {
        Ok(queue) => queue,
        Err(e) => {
            error!(error = %e, "Failed to create durable queue");
            std::process::exit(1);
        }
    };

    let store = Arc::new(MemoryDatumStore::with_latency(config.sim_store_latency));
    let collector = Arc::new(DatumCollector::new(config.options.clone(), store.clone(), queue));
    collector.set_exception_handler(Arc::new(|fault: &CollectorError| {
        warn!(error = %fault, "Collector fault");
    }));

    if let Err(e) = collector.start() {
        error!(error = %e, "Failed to start collector");
        std::process::exit(1);
    }

    let generator_handle = {
        let collector = collector.clone();
        let producer_interval = config.producer_interval;
        tokio::spawn(async move {
            info!("Generator task started");
            run_generator(collector, producer_interval).await;
        })
    };

    let health_handle = {
        let collector = collector.clone();
        tokio::spawn(async move {
            let mut ticker = interval(HEALTH_REPORT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let health = collector.health_check().await;
                info!(
                    work_queue_depth = health.work_queue_depth,
                    writer_in_flight = health.writer_in_flight,
                    queue_depth = ?health.approximate_queue_depth,
                    queue_in_flight = ?health.approximate_in_flight,
                    remote_stale = health.remote_stale,
                    received = health.stats.received,
                    stored = health.stats.stored,
                    overflowed = health.stats.overflowed_on_error + health.stats.overflowed_on_timeout,
                    "Collector health"
                );
            }
        })
    };

    info!("Datum Collector running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    generator_handle.abort();
    health_handle.abort();

    let report = collector
        .shutdown_and_wait(config.options.shutdown_wait)
        .await;
    if report.is_clean() {
        info!("Collector drained cleanly");
    } else {
        warn!(
            dropped = report.dropped,
            abandoned_in_flight = report.abandoned_in_flight.len(),
            timed_out = report.timed_out,
            "Collector shutdown incomplete"
        );
    }

    info!(
        stored_keys = store.len(),
        store_writes = store.writes(),
        "Datum Collector stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Pick the durable queue: remote when a URL is set, then a disk spool,
/// then in-process.
async fn build_queue(
    config: &Config,
) -> Result<Arc<dyn DurableQueue>, datum_collector::QueueError> {
    if config.queue_url.is_some() {
        let queue = HttpQueue::new(config)?;
        info!(base_url = %queue.base_url(), "Using HTTP durable queue");
        return Ok(Arc::new(queue));
    }

    if let Some(dir) = &config.spool_dir {
        let queue = DiskQueue::open(dir.clone(), config.visibility_timeout).await?;
        info!(dir = %queue.dir().display(), "Using disk durable queue");
        return Ok(Arc::new(queue));
    }

    warn!("No queue URL or spool directory set, overflow will not survive restart");
    Ok(Arc::new(MemoryQueue::with_visibility_timeout(
        config.visibility_timeout,
    )))
}

/// Feed generated datum into the collector at a fixed interval until aborted.
async fn run_generator(collector: Arc<DatumCollector>, producer_interval: Duration) {
    let generator = ReadingGenerator::with_defaults();
    let mut ticker = interval(producer_interval);
    let mut generated: u64 = 0;
    let mut last_report_time = std::time::Instant::now();
    let report_interval = Duration::from_secs(30);

    loop {
        ticker.tick().await;
        collector.store(generator.generate()).await;
        generated += 1;

        if last_report_time.elapsed() >= report_interval {
            info!(
                generated,
                rate = format!(
                    "{:.1}/s",
                    generated as f64 / last_report_time.elapsed().as_secs_f64()
                ),
                "Generator progress"
            );
            generated = 0;
            last_report_time = std::time::Instant::now();
        }
    }
}
