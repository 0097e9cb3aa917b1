//! Borrow path: idle selection, capacity checks and exhaustion policies

use std::sync::Arc;
use std::time::Instant;

use parking_lot::MutexGuard;

use crate::config::{KeyedPoolConfig, WhenExhaustedAction};
use crate::entry::{EntryState, PooledEntry};
use crate::errors::{FactoryOperation, PoolError, PoolResult};
use crate::factory::PoolKey;
use crate::metrics::DestroyCause;
use crate::pool::PoolShared;
use crate::registry::{SubPool, SubPoolState};

/// Outcome of one attempt to obtain an object while holding the sub-pool lock
enum Attempt<T> {
    /// An idle entry, already counted as active
    Idle(PooledEntry<T>),
    /// A reserved slot; the caller must create the resource
    Create,
    /// Per-key room exists, but `max_total` is reached while other keys hold
    /// idle objects
    Reclaim,
    Exhausted,
}

impl<K: PoolKey, T: Send + 'static> PoolShared<K, T> {
    /// Borrow an entry for `key`, following the configured exhaustion policy.
    pub(crate) fn borrow_entry(&self, key: &K) -> PoolResult<PooledEntry<T>> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let config = self.config();
        let sub = self.registry.sub_pool(key);
        let deadline = config.max_wait.map(|wait| Instant::now() + wait);
        let mut ticket: Option<u64> = None;
        let mut state = sub.state.lock();

        loop {
            if self.is_closed() {
                leave_queue(&sub, &mut state, &mut ticket);
                return Err(PoolError::PoolClosed);
            }

            // Blocked borrowers are served strictly in arrival order; a new
            // blocking borrower queues behind them instead of barging.
            let my_turn = match ticket {
                Some(ticket) => state.is_next_waiter(ticket),
                None => {
                    config.when_exhausted_action != WhenExhaustedAction::Block
                        || !state.has_waiters()
                }
            };

            if my_turn {
                match self.try_acquire(&mut state, &config) {
                    Attempt::Idle(mut entry) => {
                        debug_assert_eq!(entry.state(), EntryState::Idle);
                        if config.test_on_borrow
                            && !MutexGuard::unlocked(&mut state, || {
                                self.factory.validate(key, entry.resource())
                            })
                        {
                            tracing::debug!(
                                ?key,
                                entry = entry.id(),
                                "idle object failed validation on borrow"
                            );
                            self.metrics.record_validation_failure();
                            state.active.remove(&entry.id());
                            self.registry.release_active();
                            MutexGuard::unlocked(&mut state, || {
                                self.destroy(key, entry, DestroyCause::BorrowValidation)
                            });
                            continue;
                        }
                        leave_queue(&sub, &mut state, &mut ticket);
                        drop(state);
                        return self.activate(key, &sub, entry);
                    }
                    Attempt::Create => {
                        leave_queue(&sub, &mut state, &mut ticket);
                        drop(state);
                        let entry = self.create_active(key, &sub)?;
                        return self.activate(key, &sub, entry);
                    }
                    Attempt::Reclaim => {
                        if MutexGuard::unlocked(&mut state, || {
                            self.reclaim_idle_elsewhere(&sub)
                        }) {
                            continue;
                        }
                    }
                    Attempt::Exhausted => {}
                }

                match config.when_exhausted_action {
                    WhenExhaustedAction::Fail => {
                        leave_queue(&sub, &mut state, &mut ticket);
                        self.metrics.record_exhausted();
                        return Err(PoolError::CapacityExhausted);
                    }
                    WhenExhaustedAction::Grow => {
                        self.registry.force_reserve_active();
                        state.creating += 1;
                        leave_queue(&sub, &mut state, &mut ticket);
                        drop(state);
                        tracing::trace!(?key, "pool exhausted, growing past limits");
                        let entry = self.create_active(key, &sub)?;
                        return self.activate(key, &sub, entry);
                    }
                    WhenExhaustedAction::Block => {
                        if ticket.is_none() {
                            self.metrics.record_exhausted();
                        }
                    }
                }
            }

            if ticket.is_none() {
                ticket = Some(state.enqueue_waiter());
            }

            match deadline {
                None => sub.available.wait(&mut state),
                Some(deadline) => {
                    if sub.available.wait_until(&mut state, deadline).timed_out() {
                        leave_queue(&sub, &mut state, &mut ticket);
                        self.metrics.record_timeout();
                        let waited = config.max_wait.unwrap_or_default();
                        tracing::debug!(?key, ?waited, "borrow timed out");
                        return Err(PoolError::BorrowTimeout(waited));
                    }
                }
            }
        }
    }

    fn try_acquire(&self, state: &mut SubPoolState<T>, config: &KeyedPoolConfig) -> Attempt<T> {
        if let Some(entry) = state.take_idle(config.lifo) {
            self.registry.idle_to_active();
            state.active.insert(entry.id());
            return Attempt::Idle(entry);
        }

        if !config.has_key_room(state.total()) {
            return Attempt::Exhausted;
        }
        if self.registry.try_reserve_active(config.max_total) {
            state.creating += 1;
            return Attempt::Create;
        }
        if self.registry.totals().idle > state.idle_count() {
            Attempt::Reclaim
        } else {
            Attempt::Exhausted
        }
    }

    /// Create a resource for a slot already reserved in `creating`.
    fn create_active(&self, key: &K, sub: &Arc<SubPool<T>>) -> PoolResult<PooledEntry<T>> {
        match self.factory.create(key) {
            Ok(resource) => {
                let entry = PooledEntry::new(self.next_entry_id(), resource);
                let mut state = sub.state.lock();
                state.creating -= 1;
                state.active.insert(entry.id());
                drop(state);
                self.metrics.record_created();
                tracing::trace!(?key, entry = entry.id(), "created pooled object");
                Ok(entry)
            }
            Err(error) => {
                {
                    let mut state = sub.state.lock();
                    state.creating -= 1;
                    self.registry.release_active();
                }
                tracing::warn!(?key, %error, "failed to create pooled object");
                self.signal_capacity(sub);
                Err(PoolError::factory(FactoryOperation::Create, error))
            }
        }
    }

    fn activate(
        &self,
        key: &K,
        sub: &Arc<SubPool<T>>,
        mut entry: PooledEntry<T>,
    ) -> PoolResult<PooledEntry<T>> {
        match self.factory.activate(key, entry.resource_mut()) {
            Ok(()) => {
                entry.mark_active();
                self.metrics.record_borrowed();
                Ok(entry)
            }
            Err(error) => {
                tracing::debug!(
                    ?key,
                    entry = entry.id(),
                    %error,
                    "failed to activate pooled object"
                );
                self.discard_active(key, sub, entry);
                Err(PoolError::factory(FactoryOperation::Activate, error))
            }
        }
    }

    /// Destroy the oldest idle entry of some other key to make room under `max_total`.
    fn reclaim_idle_elsewhere(&self, origin: &Arc<SubPool<T>>) -> bool {
        for (key, sub) in self.registry.entries() {
            if Arc::ptr_eq(&sub, origin) {
                continue;
            }
            let oldest = {
                let mut state = sub.state.lock();
                let oldest = state.idle.pop_front();
                if oldest.is_some() {
                    self.registry.release_idle(1);
                }
                oldest
            };
            if let Some(entry) = oldest {
                tracing::debug!(?key, entry = entry.id(), "reclaimed idle object for another key");
                self.destroy(&key, entry, DestroyCause::Discarded);
                return true;
            }
        }
        false
    }
}

/// Drop out of the waiter queue and let the next waiter re-check.
fn leave_queue<T>(sub: &SubPool<T>, state: &mut SubPoolState<T>, ticket: &mut Option<u64>) {
    if let Some(ticket) = ticket.take() {
        state.remove_waiter(ticket);
        if state.has_waiters() {
            sub.available.notify_all();
        }
    }
}
