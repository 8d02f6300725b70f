//! Collector error type and exception handler plumbing.

use std::sync::{Arc, RwLock};

use tracing::error;

use crate::queue::QueueError;
use crate::store::StoreError;

/// Faults surfaced by the collector.
///
/// None of these reach the caller of `store`; they are reported to the
/// exception handler and to the log.
#[derive(Debug)]
pub enum CollectorError {
    /// The backing store failed a write; the datum was overflowed
    Store(StoreError),

    /// A datum could not be sent to the durable queue
    Overflow(QueueError),

    /// A worker task panicked and has stopped
    WorkerPanic { worker: String, message: String },

    /// `start` was called on a running or stopped collector
    AlreadyStarted,
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::Store(e) => write!(f, "Backing store write failed: {}", e),
            CollectorError::Overflow(e) => write!(f, "Overflow to durable queue failed: {}", e),
            CollectorError::WorkerPanic { worker, message } => {
                write!(f, "Worker {} panicked: {}", worker, message)
            }
            CollectorError::AlreadyStarted => write!(f, "Collector has already been started"),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::Store(e) => Some(e),
            CollectorError::Overflow(e) => Some(e),
            _ => None,
        }
    }
}

/// Callback receiving faults that would otherwise only be logged.
pub type ExceptionHandler = Arc<dyn Fn(&CollectorError) + Send + Sync>;

/// Shared slot holding the current exception handler.
#[derive(Clone, Default)]
pub(crate) struct FaultReporter {
    handler: Arc<RwLock<Option<ExceptionHandler>>>,
}

impl FaultReporter {
    pub(crate) fn set(&self, handler: ExceptionHandler) {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handler);
    }

    pub(crate) fn report(&self, fault: CollectorError) {
        let handler = self
            .handler
            .read()
            .map(|slot| slot.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

        match handler {
            Some(handler) => handler(&fault),
            None => error!(error = %fault, "Unhandled collector fault"),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
