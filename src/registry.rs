//! Per-key sub-pools and pool-wide counters

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};

use crate::entry::PooledEntry;
use crate::factory::PoolKey;

/// Idle queue, active set and waiter queue for one key
///
/// Borrow, return and eviction for a key all serialize through `state`.
/// `available` is signalled whenever an idle object or capacity may have
/// become available to the longest waiting borrower.
pub(crate) struct SubPool<T> {
    pub state: Mutex<SubPoolState<T>>,
    pub available: Condvar,
}

impl<T> SubPool<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SubPoolState::default()),
            available: Condvar::new(),
        }
    }
}

pub(crate) struct SubPoolState<T> {
    /// Oldest entry at the front.
    pub idle: VecDeque<PooledEntry<T>>,
    /// Ids of borrowed entries.
    pub active: HashSet<u64>,
    /// Reserved slots whose resource is still being created.
    pub creating: usize,
    /// Idle entries taken out of the queue by the evictor for validation.
    pub under_test: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

impl<T> Default for SubPoolState<T> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            active: HashSet::new(),
            creating: 0,
            under_test: 0,
            waiters: VecDeque::new(),
            next_ticket: 0,
        }
    }
}

impl<T> SubPoolState<T> {
    pub fn idle_count(&self) -> usize {
        self.idle.len() + self.under_test
    }

    pub fn active_count(&self) -> usize {
        self.active.len() + self.creating
    }

    pub fn total(&self) -> usize {
        self.idle_count() + self.active_count()
    }

    pub fn take_idle(&mut self, lifo: bool) -> Option<PooledEntry<T>> {
        if lifo {
            self.idle.pop_back()
        } else {
            self.idle.pop_front()
        }
    }

    pub fn enqueue_waiter(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.waiters.push_back(ticket);
        ticket
    }

    pub fn remove_waiter(&mut self, ticket: u64) {
        self.waiters.retain(|waiting| *waiting != ticket);
    }

    pub fn is_next_waiter(&self, ticket: u64) -> bool {
        self.waiters.front() == Some(&ticket)
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// Pool-wide object counts
///
/// `active` includes slots reserved for objects still being created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Totals {
    pub active: usize,
    pub idle: usize,
}

impl Totals {
    fn has_room(&self, max_total: Option<usize>) -> bool {
        max_total.is_none_or(|max| self.active + self.idle < max)
    }
}

/// Key to sub-pool mapping plus the counters behind `max_total`
///
/// Counter updates happen while the caller holds the affected sub-pool's
/// lock; the totals lock is always taken after, never before, a sub-pool lock.
pub(crate) struct PoolRegistry<K, T> {
    sub_pools: DashMap<K, Arc<SubPool<T>>>,
    /// Keys in creation order, for round-robin eviction.
    order: Mutex<Vec<K>>,
    totals: Mutex<Totals>,
}

impl<K: PoolKey, T> PoolRegistry<K, T> {
    pub fn new() -> Self {
        Self {
            sub_pools: DashMap::new(),
            order: Mutex::new(Vec::new()),
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Get the sub-pool for `key`, creating it on first use.
    pub fn sub_pool(&self, key: &K) -> Arc<SubPool<T>> {
        if let Some(existing) = self.get(key) {
            return existing;
        }

        match self.sub_pools.entry(key.clone()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let sub = Arc::new(SubPool::new());
                vacant.insert(Arc::clone(&sub));
                self.order.lock().push(key.clone());
                tracing::debug!(?key, "created sub-pool");
                sub
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<SubPool<T>>> {
        self.sub_pools.get(key).map(|sub| Arc::clone(sub.value()))
    }

    pub fn keys(&self) -> Vec<K> {
        self.order.lock().clone()
    }

    /// Sub-pools in key creation order.
    pub fn entries(&self) -> Vec<(K, Arc<SubPool<T>>)> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(&key).map(|sub| (key, sub)))
            .collect()
    }

    pub fn totals(&self) -> Totals {
        *self.totals.lock()
    }

    /// Reserve an active slot if `max_total` allows it.
    pub fn try_reserve_active(&self, max_total: Option<usize>) -> bool {
        let mut totals = self.totals.lock();
        if totals.has_room(max_total) {
            totals.active += 1;
            true
        } else {
            false
        }
    }

    /// Reserve an active slot regardless of `max_total`.
    pub fn force_reserve_active(&self) {
        self.totals.lock().active += 1;
    }

    pub fn idle_to_active(&self) {
        let mut totals = self.totals.lock();
        totals.idle -= 1;
        totals.active += 1;
    }

    pub fn active_to_idle(&self) {
        let mut totals = self.totals.lock();
        totals.active -= 1;
        totals.idle += 1;
    }

    pub fn release_active(&self) {
        self.totals.lock().active -= 1;
    }

    pub fn release_idle(&self, count: usize) {
        self.totals.lock().idle -= count;
    }
}
