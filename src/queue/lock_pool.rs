//! Pool of per-key async locks.
//!
//! Writers to the same key are serialized while distinct keys proceed in
//! parallel. A key borrows a lock from the idle pool on first use and hands
//! it back when its last holder releases, so memory stays bounded by the
//! number of keys in use rather than the number of keys ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

struct Lent {
    lock: KeyLock,
    holders: usize,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<KeyLock>,
    lent: HashMap<String, Lent>,
}

/// Fixed-size pool of locks lent out per key.
pub struct KeyLockPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

/// Returns the borrowed lock to the pool on drop, including when the
/// acquiring future is cancelled before the lock is held.
struct Borrow {
    pool: Arc<KeyLockPool>,
    key: String,
}

impl Drop for Borrow {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

/// Exclusive hold on one key.
pub struct KeyLockGuard {
    // Field order matters: the mutex guard drops before the borrow is returned.
    _guard: OwnedMutexGuard<()>,
    _borrow: Borrow,
}

impl KeyLockPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let idle = (0..capacity)
            .map(|_| Arc::new(tokio::sync::Mutex::new(())))
            .collect();

        Arc::new(Self {
            state: Mutex::new(PoolState {
                idle,
                lent: HashMap::new(),
            }),
            capacity,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    pub async fn lock(self: &Arc<Self>, key: &str) -> KeyLockGuard {
        let lock = {
            let mut guard = self.lock_state();
            let state = &mut *guard;

            let idle = &mut state.idle;
            let lent = state
                .lent
                .entry(key.to_string())
                .or_insert_with(|| Lent {
                    lock: idle.pop().unwrap_or_else(|| {
                        debug!(key, "Lock pool exhausted, allocating extra lock");
                        Arc::new(tokio::sync::Mutex::new(()))
                    }),
                    holders: 0,
                });
            lent.holders += 1;
            lent.lock.clone()
        };

        let borrow = Borrow {
            pool: self.clone(),
            key: key.to_string(),
        };

        KeyLockGuard {
            _guard: lock.lock_owned().await,
            _borrow: borrow,
        }
    }

    fn release(&self, key: &str) {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let finished = match state.lent.get_mut(key) {
            Some(lent) => {
                lent.holders -= 1;
                lent.holders == 0
            }
            None => false,
        };

        if finished {
            if let Some(lent) = state.lent.remove(key) {
                if state.idle.len() < self.capacity {
                    state.idle.push(lent.lock);
                }
            }
        }
    }

    /// Number of keys currently holding or waiting on a lock.
    pub fn keys_in_use(&self) -> usize {
        self.lock_state().lent.len()
    }

    /// Number of locks waiting in the pool.
    pub fn idle(&self) -> usize {
        self.lock_state().idle.len()
    }
}
