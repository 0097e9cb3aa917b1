//! Lifecycle metadata for pooled resources

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Idle,
    Active,
    Invalid,
}

/// One pooled resource and its lifecycle metadata
///
/// Owned by exactly one idle queue while `Idle` and by exactly one borrower
/// while `Active`.
#[derive(Debug)]
pub(crate) struct PooledEntry<T> {
    id: u64,
    resource: T,
    state: EntryState,
    created_at: Instant,
    last_used: Instant,
}

impl<T> PooledEntry<T> {
    /// Wrap a freshly created resource. New entries start out active.
    pub fn new(id: u64, resource: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            resource,
            state: EntryState::Active,
            created_at: now,
            last_used: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn resource(&self) -> &T {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut T {
        &mut self.resource
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn mark_active(&mut self) {
        self.state = EntryState::Active;
    }

    /// Park the entry; idle age is measured from here.
    pub fn mark_idle(&mut self) {
        self.state = EntryState::Idle;
        self.last_used = Instant::now();
    }

    /// Consume the entry on its way to the factory's `destroy`.
    pub fn invalidate(mut self) -> T {
        self.state = EntryState::Invalid;
        tracing::trace!(entry = self.id, state = ?self.state, "entry invalidated");
        self.resource
    }
}
