//! Ready/in-flight message bookkeeping shared by the local queues.
//!
//! Entries are keyed by id. Pushing an existing id replaces its body, and
//! every delivery stamps the entry with a fresh generation. Receipts carry
//! the generation, so only the receipt of the latest delivery of the latest
//! body can delete an entry. Receivers park on a `Notify` that fires on
//! every push, so an idle inbox costs nothing while waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::{QueueAttributes, QueueError, QueueMessage, Receipt};

#[derive(Debug, Clone, Copy)]
enum EntryState {
    Ready,
    InFlight { visible_at: Instant },
}

struct Entry {
    body: Vec<u8>,
    generation: u64,
    state: EntryState,
}

#[derive(Default)]
struct InboxState {
    entries: HashMap<String, Entry>,
    ready: VecDeque<String>,
    next_generation: u64,
}

pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
    visibility: Duration,
}

pub(crate) fn format_receipt(id: &str, generation: u64) -> Receipt {
    Receipt::new(format!("{}@{}", id, generation))
}

pub(crate) fn parse_receipt(receipt: &Receipt) -> Result<(String, u64), QueueError> {
    receipt
        .as_str()
        .rsplit_once('@')
        .and_then(|(id, generation)| {
            generation
                .parse()
                .ok()
                .map(|generation| (id.to_string(), generation))
        })
        .ok_or_else(|| QueueError::InvalidReceipt(receipt.to_string()))
}

impl Inbox {
    pub(crate) fn new(visibility: Duration) -> Self {
        Self {
            state: Mutex::new(InboxState::default()),
            notify: Notify::new(),
            visibility,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace an entry and wake any waiting receivers.
    pub(crate) fn push(&self, id: String, body: Vec<u8>) -> u64 {
        let mut guard = self.lock();
        let state = &mut *guard;

        state.next_generation += 1;
        let generation = state.next_generation;

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.body = body;
            entry.generation = generation;
        } else {
            state.entries.insert(
                id.clone(),
                Entry {
                    body,
                    generation,
                    state: EntryState::Ready,
                },
            );
            state.ready.push_back(id);
        }
        drop(guard);

        self.notify.notify_waiters();
        generation
    }

    /// Remove an entry if `generation` is still current.
    pub(crate) fn remove(&self, id: &str, generation: u64) -> bool {
        let mut state = self.lock();
        let current = state.entries.get(id).map(|entry| entry.generation) == Some(generation);
        if current {
            state.entries.remove(id);
        }
        current
    }

    pub(crate) async fn receive(&self, max_messages: usize, wait: Duration) -> Vec<QueueMessage> {
        let deadline = Instant::now() + wait;

        loop {
            // Registered before checking so a push between the check and the
            // wait is not missed.
            let notified = self.notify.notified();

            let batch = self.take_ready(max_messages);
            if !batch.is_empty() || max_messages == 0 {
                return batch;
            }

            let wake_at = self
                .next_visibility_expiry()
                .map_or(deadline, |at| at.min(deadline));

            if tokio::time::timeout_at(wake_at, notified).await.is_err()
                && Instant::now() >= deadline
            {
                return self.take_ready(max_messages);
            }
        }
    }

    fn take_ready(&self, max_messages: usize) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;

        for (id, entry) in state.entries.iter_mut() {
            if let EntryState::InFlight { visible_at } = entry.state {
                if visible_at <= now {
                    entry.state = EntryState::Ready;
                    state.ready.push_back(id.clone());
                }
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let Some(id) = state.ready.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if !matches!(entry.state, EntryState::Ready) {
                continue;
            }

            state.next_generation += 1;
            entry.generation = state.next_generation;
            entry.state = EntryState::InFlight {
                visible_at: now + self.visibility,
            };
            batch.push(QueueMessage {
                body: entry.body.clone(),
                receipt: format_receipt(&id, entry.generation),
            });
        }

        batch
    }

    fn next_visibility_expiry(&self) -> Option<Instant> {
        self.lock()
            .entries
            .values()
            .filter_map(|entry| match entry.state {
                EntryState::InFlight { visible_at } => Some(visible_at),
                EntryState::Ready => None,
            })
            .min()
    }

    pub(crate) fn attributes(&self) -> QueueAttributes {
        let state = self.lock();
        let in_flight = state
            .entries
            .values()
            .filter(|entry| matches!(entry.state, EntryState::InFlight { .. }))
            .count() as u64;

        QueueAttributes {
            approximate_depth: state.entries.len() as u64 - in_flight,
            approximate_in_flight: in_flight,
        }
    }
}
