//! Idle-object eviction and the background evictor thread

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::MutexGuard;

use crate::config::KeyedPoolConfig;
use crate::errors::PoolResult;
use crate::factory::PoolKey;
use crate::metrics::DestroyCause;
use crate::pool::PoolShared;
use crate::registry::SubPool;
use crate::release::IdleAdd;

/// Where the next sweep resumes
///
/// Keys are visited in creation order and the cursor survives between
/// sweeps, so short sweeps do not keep re-testing the first key.
/// `position` counts idle entries from the oldest end of the key's queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EvictionCursor {
    pub key_index: usize,
    pub position: usize,
}

impl EvictionCursor {
    fn next_key(&mut self, key_count: usize) {
        self.key_index = (self.key_index + 1) % key_count.max(1);
        self.position = 0;
    }
}

/// Result of visiting one idle slot
#[derive(Debug, PartialEq, Eq)]
enum Visit {
    /// No idle entry at the cursor position
    Empty,
    /// The entry was destroyed; later entries shifted into its position
    Removed,
    Kept,
}

impl<K: PoolKey, T: Send + 'static> PoolShared<K, T> {
    /// Run one sweep, then top every key up to `min_idle`.
    pub(crate) fn evict(&self) {
        if self.is_closed() {
            return;
        }
        let config = self.config();
        let budget = config.tests_per_run(self.registry.totals().idle);
        if budget > 0 {
            let (visited, removed) = self.sweep(budget, &config);
            tracing::debug!(visited, removed, "eviction sweep finished");
        }

        if config.min_idle == 0 {
            return;
        }
        for (key, sub) in self.registry.entries() {
            if let Err(error) = self.ensure_min_idle(&key, &sub, &config) {
                tracing::warn!(?key, %error, "failed to replenish idle objects");
            }
        }
    }

    fn sweep(&self, budget: usize, config: &KeyedPoolConfig) -> (usize, usize) {
        let entries = self.registry.entries();
        if entries.is_empty() {
            return (0, 0);
        }

        let mut cursor = self.cursor.lock();
        let mut visited = 0;
        let mut removed = 0;
        let mut empty_keys = 0;

        // Give up after a full lap of keys with nothing left to visit.
        while visited < budget && empty_keys <= entries.len() {
            if cursor.key_index >= entries.len() {
                *cursor = EvictionCursor::default();
            }
            let (key, sub) = &entries[cursor.key_index];

            match self.visit_idle(key, sub, cursor.position, config) {
                Visit::Empty => {
                    cursor.next_key(entries.len());
                    empty_keys += 1;
                }
                Visit::Removed => {
                    visited += 1;
                    removed += 1;
                    empty_keys = 0;
                }
                Visit::Kept => {
                    visited += 1;
                    cursor.position += 1;
                    empty_keys = 0;
                }
            }
        }

        (visited, removed)
    }

    /// Apply the idle-age and idle-validation checks to one entry.
    fn visit_idle(
        &self,
        key: &K,
        sub: &Arc<SubPool<T>>,
        position: usize,
        config: &KeyedPoolConfig,
    ) -> Visit {
        let mut state = sub.state.lock();
        let Some(candidate) = state.idle.get(position) else {
            return Visit::Empty;
        };

        let expired = config
            .min_evictable_idle_time
            .is_some_and(|threshold| candidate.idle_for() >= threshold);
        if expired && state.idle_count() > config.min_idle {
            let Some(entry) = state.idle.remove(position) else {
                return Visit::Empty;
            };
            self.registry.release_idle(1);
            drop(state);
            tracing::trace!(?key, entry = entry.id(), "evicting idle object");
            self.destroy(key, entry, DestroyCause::Evicted);
            self.signal_capacity(sub);
            return Visit::Removed;
        }

        if !config.test_while_idle {
            return Visit::Kept;
        }

        // Out of the queue while being tested, so no borrower can take it.
        let Some(entry) = state.idle.remove(position) else {
            return Visit::Empty;
        };
        state.under_test += 1;
        let valid =
            MutexGuard::unlocked(&mut state, || self.factory.validate(key, entry.resource()));
        state.under_test -= 1;

        if valid && !self.is_closed() {
            let at = position.min(state.idle.len());
            state.idle.insert(at, entry);
            if state.has_waiters() {
                sub.available.notify_all();
            }
            return Visit::Kept;
        }

        self.registry.release_idle(1);
        drop(state);
        if !valid {
            tracing::debug!(?key, entry = entry.id(), "idle object failed validation");
            self.metrics.record_validation_failure();
        }
        self.destroy(key, entry, DestroyCause::Evicted);
        self.signal_capacity(sub);
        Visit::Removed
    }

    /// Create idle objects for `key` until `min_idle` is met or capacity runs out.
    ///
    /// The target is capped at `max_idle`; anything above it would be
    /// destroyed as soon as it was parked.
    pub(crate) fn ensure_min_idle(
        &self,
        key: &K,
        sub: &Arc<SubPool<T>>,
        config: &KeyedPoolConfig,
    ) -> PoolResult<()> {
        let target = config.idle_target();
        while !self.is_closed() && sub.state.lock().idle_count() < target {
            match self.add_idle(key, sub, config)? {
                IdleAdd::Parked => {}
                IdleAdd::Rejected | IdleAdd::NoCapacity => {
                    tracing::trace!(?key, target, "no room left to reach min_idle");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Handle to the background evictor thread
///
/// The thread only holds a weak reference to the pool and exits on its own
/// once the pool is gone.
pub(crate) struct EvictionScheduler {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionScheduler {
    /// Spawn the evictor. Returns `None` if the thread cannot be spawned.
    pub fn start<K: PoolKey, T: Send + 'static>(
        shared: &Arc<PoolShared<K, T>>,
        period: Duration,
    ) -> Option<Self> {
        let pool: Weak<PoolShared<K, T>> = Arc::downgrade(shared);
        let (stop, stopped) = channel::bounded::<()>(1);

        let spawned = thread::Builder::new()
            .name("keyed-pool-evictor".to_string())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => match pool.upgrade() {
                            Some(pool) => pool.evict(),
                            None => break,
                        },
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("evictor stopped");
            });

        match spawned {
            Ok(handle) => {
                tracing::debug!(?period, "evictor started");
                Some(Self {
                    stop,
                    handle: Some(handle),
                })
            }
            Err(error) => {
                tracing::warn!(%error, "failed to spawn evictor thread");
                None
            }
        }
    }

    /// Signal the thread and wait for the sweep in progress, if any.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
