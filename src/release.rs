//! Return path: validation, passivation and idle-queue insertion

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::config::KeyedPoolConfig;
use crate::entry::PooledEntry;
use crate::errors::{FactoryOperation, PoolError, PoolResult};
use crate::factory::PoolKey;
use crate::metrics::DestroyCause;
use crate::pool::PoolShared;
use crate::registry::{SubPool, SubPoolState};

/// Outcome of creating one object to park idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleAdd {
    Parked,
    /// Created, then destroyed because the idle queue was full or the pool closed
    Rejected,
    /// No per-key or global room for another object
    NoCapacity,
}

impl<K: PoolKey, T: Send + 'static> PoolShared<K, T> {
    /// Take back a borrowed entry, re-pooling it or destroying it.
    pub(crate) fn release(&self, key: &K, mut entry: PooledEntry<T>) -> PoolResult<()> {
        let sub = self.tracked_sub_pool(key, &entry)?;
        self.metrics.record_returned();

        let config = self.config();
        if self.is_closed() || !self.prepare_for_idle(key, &mut entry, &config) {
            self.discard_active(key, &sub, entry);
            return Ok(());
        }

        let mut state = sub.state.lock();
        state.active.remove(&entry.id());
        // Checked under the sub-pool lock so close() cannot miss the entry.
        if self.is_closed() || !config.has_idle_room(state.idle_count()) {
            self.registry.release_active();
            drop(state);
            self.destroy(key, entry, DestroyCause::Discarded);
            self.signal_capacity(&sub);
            return Ok(());
        }

        entry.mark_idle();
        state.idle.push_back(entry);
        self.registry.active_to_idle();
        self.announce_idle(&sub, state, &config);
        Ok(())
    }

    /// Destroy a borrowed entry without re-pooling it.
    pub(crate) fn invalidate_entry(&self, key: &K, entry: PooledEntry<T>) -> PoolResult<()> {
        let sub = self.tracked_sub_pool(key, &entry)?;
        self.discard_active(key, &sub, entry);
        Ok(())
    }

    /// Drop an active entry from the counters, destroy it and wake waiters.
    pub(crate) fn discard_active(&self, key: &K, sub: &Arc<SubPool<T>>, entry: PooledEntry<T>) {
        {
            let mut state = sub.state.lock();
            if state.active.remove(&entry.id()) {
                self.registry.release_active();
            }
        }
        self.destroy(key, entry, DestroyCause::Discarded);
        self.signal_capacity(sub);
    }

    /// Create one resource and park it idle.
    pub(crate) fn add_idle(
        &self,
        key: &K,
        sub: &Arc<SubPool<T>>,
        config: &KeyedPoolConfig,
    ) -> PoolResult<IdleAdd> {
        {
            let mut state = sub.state.lock();
            if !config.has_key_room(state.total())
                || !self.registry.try_reserve_active(config.max_total)
            {
                return Ok(IdleAdd::NoCapacity);
            }
            state.creating += 1;
        }

        let created = self
            .factory
            .create(key)
            .map_err(|error| PoolError::factory(FactoryOperation::Create, error));
        let mut entry = match created {
            Ok(resource) => {
                self.metrics.record_created();
                PooledEntry::new(self.next_entry_id(), resource)
            }
            Err(error) => {
                {
                    let mut state = sub.state.lock();
                    state.creating -= 1;
                    self.registry.release_active();
                }
                self.signal_capacity(sub);
                return Err(error);
            }
        };

        let passivated = self.factory.passivate(key, entry.resource_mut());

        let mut state = sub.state.lock();
        state.creating -= 1;
        if let Err(error) = passivated {
            self.registry.release_active();
            drop(state);
            self.destroy(key, entry, DestroyCause::Discarded);
            self.signal_capacity(sub);
            return Err(PoolError::factory(FactoryOperation::Passivate, error));
        }
        if self.is_closed() || !config.has_idle_room(state.idle_count()) {
            self.registry.release_active();
            drop(state);
            self.destroy(key, entry, DestroyCause::Discarded);
            self.signal_capacity(sub);
            return Ok(IdleAdd::Rejected);
        }

        tracing::trace!(?key, entry = entry.id(), "added idle object");
        entry.mark_idle();
        state.idle.push_back(entry);
        self.registry.active_to_idle();
        self.announce_idle(sub, state, config);
        Ok(IdleAdd::Parked)
    }

    /// Wake whoever can use the entry just parked in `sub`.
    ///
    /// Waiters on the same key take it directly. Without local waiters and
    /// with `max_total` set, waiters on other keys may reclaim it.
    fn announce_idle(
        &self,
        sub: &Arc<SubPool<T>>,
        state: MutexGuard<'_, SubPoolState<T>>,
        config: &KeyedPoolConfig,
    ) {
        let local_waiters = state.has_waiters();
        drop(state);
        if local_waiters {
            sub.available.notify_all();
        } else if config.max_total.is_some() {
            self.signal_capacity(sub);
        }
    }

    /// The sub-pool that lent out `entry` under `key`.
    fn tracked_sub_pool(&self, key: &K, entry: &PooledEntry<T>) -> PoolResult<Arc<SubPool<T>>> {
        let tracked = self
            .registry
            .get(key)
            .filter(|sub| sub.state.lock().active.contains(&entry.id()));
        if tracked.is_none() {
            tracing::warn!(?key, entry = entry.id(), "returned object is not tracked by this pool");
        }
        tracked.ok_or(PoolError::InvalidReturn)
    }

    /// Run the return-time checks. `false` means the entry must be destroyed.
    fn prepare_for_idle(
        &self,
        key: &K,
        entry: &mut PooledEntry<T>,
        config: &KeyedPoolConfig,
    ) -> bool {
        if config.test_on_return && !self.factory.validate(key, entry.resource()) {
            tracing::debug!(?key, entry = entry.id(), "object failed validation on return");
            self.metrics.record_validation_failure();
            return false;
        }
        if let Err(error) = self.factory.passivate(key, entry.resource_mut()) {
            tracing::debug!(?key, entry = entry.id(), %error, "failed to passivate object");
            return false;
        }
        true
    }
}
