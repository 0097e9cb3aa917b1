//! Keyed object pool and its public surface

use crate::config::{KeyedPoolConfig, WhenExhaustedAction};
use crate::entry::PooledEntry;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EvictionCursor, EvictionScheduler};
use crate::factory::{KeyedResourceFactory, PoolKey};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsExporter;
use crate::metrics::{DestroyCause, MetricsTracker, PoolMetrics};
use crate::registry::{PoolRegistry, SubPool};
use crate::release::IdleAdd;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// State shared by a pool, its borrowed objects and its evictor thread
pub(crate) struct PoolShared<K, T> {
    pub factory: Arc<dyn KeyedResourceFactory<K, T>>,
    pub registry: PoolRegistry<K, T>,
    pub metrics: MetricsTracker,
    pub cursor: Mutex<EvictionCursor>,
    config: RwLock<KeyedPoolConfig>,
    closed: AtomicBool,
    next_entry_id: AtomicU64,
}

impl<K: PoolKey, T: Send + 'static> PoolShared<K, T> {
    fn new(factory: Arc<dyn KeyedResourceFactory<K, T>>, config: KeyedPoolConfig) -> Self {
        Self {
            factory,
            registry: PoolRegistry::new(),
            metrics: MetricsTracker::new(),
            cursor: Mutex::new(EvictionCursor::default()),
            config: RwLock::new(config.normalized()),
            closed: AtomicBool::new(false),
            next_entry_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> KeyedPoolConfig {
        *self.config.read()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn next_entry_id(&self) -> u64 {
        self.next_entry_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand a resource to the factory's `destroy`. Failures are logged only.
    pub fn destroy(&self, key: &K, entry: PooledEntry<T>, cause: DestroyCause) {
        let id = entry.id();
        let age = entry.created_at().elapsed();
        if let Err(error) = self.factory.destroy(key, entry.invalidate()) {
            tracing::warn!(?key, entry = id, %error, "failed to destroy pooled object");
        } else {
            tracing::trace!(?key, entry = id, ?cause, ?age, "destroyed pooled object");
        }
        self.metrics.record_destroyed(cause);
    }

    /// Wake borrowers that may be able to use capacity freed in `origin`.
    ///
    /// With `max_total` set, freed capacity is usable by any key, so every
    /// sub-pool with waiters is signalled. Must be called without holding a
    /// sub-pool lock.
    pub fn signal_capacity(&self, origin: &Arc<SubPool<T>>) {
        origin.available.notify_all();
        if self.config().max_total.is_none() {
            return;
        }
        for (_, sub) in self.registry.entries() {
            if Arc::ptr_eq(&sub, origin) {
                continue;
            }
            let state = sub.state.lock();
            if state.has_waiters() {
                sub.available.notify_all();
            }
        }
    }

    fn wake_all(&self) {
        for (_, sub) in self.registry.entries() {
            let _state = sub.state.lock();
            sub.available.notify_all();
        }
    }

    pub fn clear_key(&self, key: &K) {
        let Some(sub) = self.registry.get(key) else {
            return;
        };
        let drained: Vec<_> = {
            let mut state = sub.state.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            self.registry.release_idle(drained.len());
            drained
        };
        if drained.is_empty() {
            return;
        }
        tracing::debug!(?key, count = drained.len(), "cleared idle objects");
        for entry in drained {
            self.destroy(key, entry, DestroyCause::Discarded);
        }
        self.signal_capacity(&sub);
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        for key in self.registry.keys() {
            self.clear_key(&key);
        }
        self.wake_all();
        true
    }
}

/// A borrowed object that returns to its pool when dropped
///
/// Dropping the guard is equivalent to
/// [`KeyedObjectPool::return_object`].
pub struct PooledObject<K: PoolKey, T: Send + 'static> {
    entry: Option<PooledEntry<T>>,
    key: K,
    pool: Arc<PoolShared<K, T>>,
}

impl<K: PoolKey, T: Send + 'static> PooledObject<K, T> {
    fn new(key: K, entry: PooledEntry<T>, pool: Arc<PoolShared<K, T>>) -> Self {
        Self {
            entry: Some(entry),
            key,
            pool,
        }
    }

    /// The key this object was borrowed under
    pub fn key(&self) -> &K {
        &self.key
    }

    /// When the underlying resource was created
    pub fn created_at(&self) -> Instant {
        self.entry().created_at()
    }

    /// When the object was last parked idle, or created if it never was
    pub fn last_used(&self) -> Instant {
        self.entry().last_used()
    }

    fn entry(&self) -> &PooledEntry<T> {
        self.entry.as_ref().expect("Entry already taken")
    }

    fn take_entry(mut self) -> PooledEntry<T> {
        self.entry.take().expect("Entry already taken")
    }
}

impl<K: PoolKey, T: Send + 'static> Deref for PooledObject<K, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.entry().resource()
    }
}

impl<K: PoolKey, T: Send + 'static> DerefMut for PooledObject<K, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry.as_mut().expect("Entry already taken").resource_mut()
    }
}

impl<K: PoolKey, T: Send + 'static> Drop for PooledObject<K, T> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take()
            && let Err(error) = self.pool.release(&self.key, entry)
        {
            tracing::warn!(key = ?self.key, %error, "dropped object was not accepted by its pool");
        }
    }
}

/// Thread-safe object pool partitioned by key
///
/// Each key has its own idle queue, active count and waiter queue; keys do
/// not contend with each other except through the optional `max_total` cap.
/// Dropping the pool closes it.
///
/// # Examples
///
/// ```
/// use keyed_objectpool::{FactoryError, KeyedObjectPool, KeyedPoolConfig};
///
/// let pool: KeyedObjectPool<String, String> = KeyedObjectPool::new(
///     |host: &String| -> Result<String, FactoryError> { Ok(format!("conn to {host}")) },
///     KeyedPoolConfig::new().with_max_active(2),
/// );
///
/// let key = "db-1".to_string();
/// {
///     let conn = pool.borrow(&key).unwrap();
///     assert_eq!(*conn, "conn to db-1");
///     assert_eq!(pool.num_active(&key), 1);
/// }
/// assert_eq!(pool.num_idle(&key), 1);
/// ```
pub struct KeyedObjectPool<K: PoolKey, T: Send + 'static> {
    shared: Arc<PoolShared<K, T>>,
    evictor: Mutex<Option<EvictionScheduler>>,
}

impl<K: PoolKey, T: Send + 'static> KeyedObjectPool<K, T> {
    /// Create a pool around a resource factory
    pub fn new<F>(factory: F, config: KeyedPoolConfig) -> Self
    where
        F: KeyedResourceFactory<K, T> + 'static,
    {
        Self::with_factory(Arc::new(factory), config)
    }

    /// Create a pool around a shared resource factory
    ///
    /// Zero durations in `config` are treated as `None`.
    pub fn with_factory(
        factory: Arc<dyn KeyedResourceFactory<K, T>>,
        config: KeyedPoolConfig,
    ) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared::new(factory, config)),
            evictor: Mutex::new(None),
        };
        pool.restart_evictor(pool.shared.config().time_between_eviction_runs);
        pool
    }

    /// Borrow an object for `key`
    ///
    /// Uses an idle object when one is available, otherwise creates one if
    /// capacity allows, otherwise follows `when_exhausted_action`.
    pub fn borrow(&self, key: &K) -> PoolResult<PooledObject<K, T>> {
        let entry = self.shared.borrow_entry(key)?;
        Ok(PooledObject::new(key.clone(), entry, Arc::clone(&self.shared)))
    }

    /// Try to borrow an object, discarding the error
    pub fn try_borrow(&self, key: &K) -> Option<PooledObject<K, T>> {
        self.borrow(key).ok()
    }

    /// Borrow on tokio's blocking pool so async callers never block a worker
    pub async fn borrow_async(&self, key: K) -> PoolResult<PooledObject<K, T>> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            let entry = shared.borrow_entry(&key)?;
            Ok(PooledObject::new(key, entry, shared))
        })
        .await
        .map_err(|_| PoolError::Cancelled)?
    }

    /// Return a borrowed object
    ///
    /// Objects issued by a different pool are rejected with
    /// [`PoolError::InvalidReturn`] and go back to the pool that issued them.
    pub fn return_object(&self, object: PooledObject<K, T>) -> PoolResult<()> {
        if !Arc::ptr_eq(&object.pool, &self.shared) {
            return Err(PoolError::InvalidReturn);
        }
        let key = object.key.clone();
        self.shared.release(&key, object.take_entry())
    }

    /// Destroy a borrowed object instead of returning it
    pub fn invalidate(&self, object: PooledObject<K, T>) -> PoolResult<()> {
        if !Arc::ptr_eq(&object.pool, &self.shared) {
            return Err(PoolError::InvalidReturn);
        }
        let key = object.key.clone();
        self.shared.invalidate_entry(&key, object.take_entry())
    }

    /// Create one object and park it idle under `key`
    pub fn add_object(&self, key: &K) -> PoolResult<()> {
        if self.shared.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        let sub = self.shared.registry.sub_pool(key);
        let config = self.shared.config();
        match self.shared.add_idle(key, &sub, &config)? {
            IdleAdd::Parked | IdleAdd::Rejected => Ok(()),
            IdleAdd::NoCapacity => Err(PoolError::CapacityExhausted),
        }
    }

    /// Create the sub-pool for `key` and top it up to `min_idle`
    pub fn prepare_pool(&self, key: &K) -> PoolResult<()> {
        if self.shared.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        let sub = self.shared.registry.sub_pool(key);
        self.shared.ensure_min_idle(key, &sub, &self.shared.config())
    }

    /// Run one eviction sweep on the calling thread
    pub fn evict(&self) {
        self.shared.evict();
    }

    /// Destroy every idle object
    pub fn clear(&self) {
        for key in self.shared.registry.keys() {
            self.shared.clear_key(&key);
        }
    }

    /// Destroy the idle objects of one key
    pub fn clear_key(&self, key: &K) {
        self.shared.clear_key(key);
    }

    /// Close the pool
    ///
    /// Idle objects are destroyed, blocked borrowers fail with
    /// [`PoolError::PoolClosed`], and borrowed objects are destroyed as they
    /// come back. Closing twice is a no-op.
    pub fn close(&self) {
        if let Some(evictor) = self.evictor.lock().take() {
            evictor.stop();
        }
        if self.shared.close() {
            tracing::debug!("pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Borrowed objects for `key`, including ones being created
    pub fn num_active(&self, key: &K) -> usize {
        self.shared
            .registry
            .get(key)
            .map_or(0, |sub| sub.state.lock().active_count())
    }

    pub fn num_idle(&self, key: &K) -> usize {
        self.shared
            .registry
            .get(key)
            .map_or(0, |sub| sub.state.lock().idle_count())
    }

    /// Borrowers blocked on `key`
    pub fn num_waiters(&self, key: &K) -> usize {
        self.shared
            .registry
            .get(key)
            .map_or(0, |sub| sub.state.lock().waiter_count())
    }

    pub fn num_active_total(&self) -> usize {
        self.shared.registry.totals().active
    }

    pub fn num_idle_total(&self) -> usize {
        self.shared.registry.totals().idle
    }

    /// Keys that have a sub-pool, in creation order
    pub fn keys(&self) -> Vec<K> {
        self.shared.registry.keys()
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        let totals = self.shared.registry.totals();
        self.shared.metrics.get_metrics(
            totals.active,
            totals.idle,
            self.shared.registry.keys().len(),
            self.shared.config().max_total,
        )
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format
    #[cfg(feature = "metrics")]
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        MetricsExporter::export_prometheus(&self.get_metrics(), pool_name, tags)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> KeyedPoolConfig {
        self.shared.config()
    }

    /// Replace the whole configuration. Zero durations are treated as `None`.
    pub fn set_config(&self, config: KeyedPoolConfig) {
        let config = config.normalized();
        let previous = self.update_config(|current| *current = config);
        if previous.time_between_eviction_runs != config.time_between_eviction_runs {
            self.restart_evictor(config.time_between_eviction_runs);
        }
    }

    pub fn max_active(&self) -> Option<usize> {
        self.config().max_active
    }

    pub fn set_max_active(&self, max: Option<usize>) {
        self.update_config(|config| config.max_active = max);
    }

    pub fn max_total(&self) -> Option<usize> {
        self.config().max_total
    }

    pub fn set_max_total(&self, max: Option<usize>) {
        self.update_config(|config| config.max_total = max);
    }

    pub fn max_idle(&self) -> Option<usize> {
        self.config().max_idle
    }

    pub fn set_max_idle(&self, max: Option<usize>) {
        self.update_config(|config| config.max_idle = max);
    }

    pub fn min_idle(&self) -> usize {
        self.config().min_idle
    }

    pub fn set_min_idle(&self, min: usize) {
        self.update_config(|config| config.min_idle = min);
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.config().max_wait
    }

    /// `None` waits indefinitely
    pub fn set_max_wait(&self, wait: Option<Duration>) {
        self.update_config(|config| config.max_wait = wait.filter(|wait| !wait.is_zero()));
    }

    pub fn when_exhausted_action(&self) -> WhenExhaustedAction {
        self.config().when_exhausted_action
    }

    pub fn set_when_exhausted_action(&self, action: WhenExhaustedAction) {
        self.update_config(|config| config.when_exhausted_action = action);
    }

    pub fn lifo(&self) -> bool {
        self.config().lifo
    }

    pub fn set_lifo(&self, lifo: bool) {
        self.update_config(|config| config.lifo = lifo);
    }

    pub fn test_on_borrow(&self) -> bool {
        self.config().test_on_borrow
    }

    pub fn set_test_on_borrow(&self, test: bool) {
        self.update_config(|config| config.test_on_borrow = test);
    }

    pub fn test_on_return(&self) -> bool {
        self.config().test_on_return
    }

    pub fn set_test_on_return(&self, test: bool) {
        self.update_config(|config| config.test_on_return = test);
    }

    pub fn test_while_idle(&self) -> bool {
        self.config().test_while_idle
    }

    pub fn set_test_while_idle(&self, test: bool) {
        self.update_config(|config| config.test_while_idle = test);
    }

    pub fn time_between_eviction_runs(&self) -> Option<Duration> {
        self.config().time_between_eviction_runs
    }

    /// Change the evictor period, restarting the evictor. `None` stops it.
    pub fn set_time_between_eviction_runs(&self, period: Option<Duration>) {
        let period = period.filter(|period| !period.is_zero());
        self.update_config(|config| config.time_between_eviction_runs = period);
        self.restart_evictor(period);
    }

    pub fn num_tests_per_eviction_run(&self) -> i32 {
        self.config().num_tests_per_eviction_run
    }

    pub fn set_num_tests_per_eviction_run(&self, tests: i32) {
        self.update_config(|config| config.num_tests_per_eviction_run = tests);
    }

    pub fn min_evictable_idle_time(&self) -> Option<Duration> {
        self.config().min_evictable_idle_time
    }

    pub fn set_min_evictable_idle_time(&self, idle: Option<Duration>) {
        let idle = idle.filter(|idle| !idle.is_zero());
        self.update_config(|config| config.min_evictable_idle_time = idle);
    }

    /// Apply `change` under the config lock and wake blocked borrowers so
    /// they re-read the limits. Returns the previous configuration.
    fn update_config(&self, change: impl FnOnce(&mut KeyedPoolConfig)) -> KeyedPoolConfig {
        let previous = {
            let mut config = self.shared.config.write();
            let previous = *config;
            change(&mut *config);
            previous
        };
        self.shared.wake_all();
        previous
    }

    fn restart_evictor(&self, period: Option<Duration>) {
        let mut evictor = self.evictor.lock();
        if let Some(running) = evictor.take() {
            running.stop();
        }
        if self.shared.is_closed() {
            return;
        }
        *evictor = period.and_then(|period| EvictionScheduler::start(&self.shared, period));
    }
}

impl<K: PoolKey, T: Send + 'static> Drop for KeyedObjectPool<K, T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds keyed pools that share a resource factory and configuration
///
/// # Examples
///
/// ```
/// use keyed_objectpool::{
///     FactoryError, KeyedObjectPoolFactory, KeyedPoolConfig, WhenExhaustedAction,
/// };
/// use std::time::Duration;
///
/// let config = KeyedPoolConfig::new()
///     .with_max_active(1)
///     .with_max_wait(Duration::from_millis(3))
///     .with_when_exhausted_action(WhenExhaustedAction::Grow);
/// let factory: KeyedObjectPoolFactory<u8, u32> = KeyedObjectPoolFactory::with_config(
///     |_: &u8| -> Result<u32, FactoryError> { Ok(0) },
///     config,
/// );
///
/// let pool = factory.create_pool();
/// assert_eq!(pool.max_active(), Some(1));
/// assert_eq!(pool.max_wait(), Some(Duration::from_millis(3)));
/// assert_eq!(pool.when_exhausted_action(), WhenExhaustedAction::Grow);
/// ```
pub struct KeyedObjectPoolFactory<K, T> {
    factory: Arc<dyn KeyedResourceFactory<K, T>>,
    config: KeyedPoolConfig,
}

impl<K: PoolKey, T: Send + 'static> KeyedObjectPoolFactory<K, T> {
    /// Use the default configuration
    pub fn new<F>(factory: F) -> Self
    where
        F: KeyedResourceFactory<K, T> + 'static,
    {
        Self::with_config(factory, KeyedPoolConfig::default())
    }

    pub fn with_config<F>(factory: F, config: KeyedPoolConfig) -> Self
    where
        F: KeyedResourceFactory<K, T> + 'static,
    {
        Self {
            factory: Arc::new(factory),
            config: config.normalized(),
        }
    }

    /// The configuration new pools start with
    pub fn config(&self) -> &KeyedPoolConfig {
        &self.config
    }

    pub fn create_pool(&self) -> KeyedObjectPool<K, T> {
        KeyedObjectPool::with_factory(Arc::clone(&self.factory), self.config)
    }
}
