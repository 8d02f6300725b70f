//! Datum Collector Library
//!
//! Asynchronous durable collection of time-series datum:
//!
//! - **collector**: `DatumCollector` facade, lifecycle, health and stats
//! - **work_queue**: Bounded in-process queue shared by producers and workers
//! - **writer** / **reader**: Worker pools writing to the backing store and
//!   replaying the durable queue
//! - **queue**: Durable queue port with HTTP, disk and in-memory implementations
//! - **store**: Backing store port
//! - **datum**: Datum values, keys and their JSON wire encoding
//! - **config**: Environment-based configuration
//! - **simulator**: Synthetic producer load
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use datum_collector::config::CollectorOptions;
//! use datum_collector::queue::MemoryQueue;
//! use datum_collector::simulator::ReadingGenerator;
//! use datum_collector::store::MemoryDatumStore;
//! use datum_collector::DatumCollector;
//!
//! #[tokio::main]
//! async fn main() {
//!     let collector = DatumCollector::new(
//!         CollectorOptions::default(),
//!         Arc::new(MemoryDatumStore::new()),
//!         Arc::new(MemoryQueue::new()),
//!     );
//!     collector.start().expect("collector starts once");
//!
//!     let generator = ReadingGenerator::with_defaults();
//!     for datum in generator.generate_batch(100) {
//!         collector.store(datum).await;
//!     }
//!
//!     let report = collector.shutdown_and_wait(Duration::from_secs(5)).await;
//!     assert!(report.is_clean());
//! }
//! ```

pub mod collector;
pub mod config;
pub mod datum;
pub mod error;
pub mod queue;
pub mod simulator;
pub mod stats;
pub mod store;
pub mod work_queue;

mod reader;
mod writer;

#[cfg(test)]
mod testing;

pub use collector::{DatumCollector, HealthSnapshot, ShutdownReport, HEALTH_CHECK_BUDGET};
pub use config::{CollectorOptions, Config, ConfigError};
pub use datum::{Datum, DatumKey, DecodeError, ObjectDatum, ObjectKind, StreamDatum};
pub use error::{CollectorError, ExceptionHandler};
pub use queue::{DiskQueue, DurableQueue, HttpQueue, MemoryQueue, QueueError};
pub use reader::Backoff;
pub use stats::{CollectorStats, StatsSnapshot};
pub use store::{DatumStore, MemoryDatumStore, StoreError};
