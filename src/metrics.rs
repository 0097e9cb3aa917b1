//! Metrics collection and export for keyed pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Metrics snapshot for a keyed pool
///
/// # Examples
///
/// ```
/// use keyed_objectpool::{FactoryError, KeyedObjectPool, KeyedPoolConfig};
///
/// let pool: KeyedObjectPool<&str, String> = KeyedObjectPool::new(
///     |key: &&str| -> Result<String, FactoryError> { Ok(key.to_string()) },
///     KeyedPoolConfig::default(),
/// );
///
/// {
///     let _conn = pool.borrow(&"db").unwrap();
///     let metrics = pool.get_metrics();
///     assert_eq!(metrics.total_borrowed, 1);
///     assert_eq!(metrics.active_objects, 1);
/// }
/// assert_eq!(pool.get_metrics().idle_objects, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Successful borrows
    pub total_borrowed: usize,

    /// Objects handed back, whether re-pooled or destroyed
    pub total_returned: usize,

    pub total_created: usize,

    pub total_destroyed: usize,

    /// Subset of `total_destroyed` removed by eviction sweeps
    pub destroyed_by_evictor: usize,

    /// Subset of `total_destroyed` that failed validation on borrow
    pub destroyed_on_borrow_validation: usize,

    pub validation_failures: usize,

    /// Borrows that found no idle object and no capacity
    pub exhausted_events: usize,

    pub borrow_timeouts: usize,

    pub active_objects: usize,

    pub idle_objects: usize,

    /// Number of keys with a sub-pool
    pub keys: usize,

    /// Share of `max_total` in use (0.0 when unbounded)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_borrowed".to_string(), self.total_borrowed.to_string());
        metrics.insert("total_returned".to_string(), self.total_returned.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("destroyed_by_evictor".to_string(), self.destroyed_by_evictor.to_string());
        metrics.insert(
            "destroyed_on_borrow_validation".to_string(),
            self.destroyed_on_borrow_validation.to_string(),
        );
        metrics.insert("validation_failures".to_string(), self.validation_failures.to_string());
        metrics.insert("exhausted_events".to_string(), self.exhausted_events.to_string());
        metrics.insert("borrow_timeouts".to_string(), self.borrow_timeouts.to_string());
        metrics.insert("active_objects".to_string(), self.active_objects.to_string());
        metrics.insert("idle_objects".to_string(), self.idle_objects.to_string());
        metrics.insert("keys".to_string(), self.keys.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics
    }
}

/// Metrics exporter for the Prometheus text format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Render a snapshot in Prometheus exposition format
    ///
    /// Every series carries a `pool` label plus the given `tags`.
    ///
    /// # Examples
    ///
    /// ```
    /// use keyed_objectpool::{FactoryError, KeyedObjectPool, KeyedPoolConfig};
    /// use std::collections::HashMap;
    ///
    /// let pool: KeyedObjectPool<u32, u64> = KeyedObjectPool::new(
    ///     |_: &u32| -> Result<u64, FactoryError> { Ok(0) },
    ///     KeyedPoolConfig::default(),
    /// );
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = pool.export_metrics_prometheus("my_pool", Some(&tags)).unwrap();
    /// assert!(output.contains("keyedpool_objects_active"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            let mut opts = Opts::new(name, help).const_label("pool", pool_name);
            if let Some(tags) = tags {
                for (key, value) in tags {
                    opts = opts.const_label(key.as_str(), value.as_str());
                }
            }
            opts
        };

        let gauges = [
            ("keyedpool_objects_active", "Current borrowed objects", metrics.active_objects),
            ("keyedpool_objects_idle", "Current idle objects", metrics.idle_objects),
            ("keyedpool_keys", "Keys with a sub-pool", metrics.keys),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help))?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge))?;
        }

        let utilization =
            Gauge::with_opts(opts("keyedpool_utilization", "Share of max_total in use"))?;
        utilization.set(metrics.utilization);
        registry.register(Box::new(utilization))?;

        let counters = [
            ("keyedpool_borrowed_total", "Successful borrows", metrics.total_borrowed),
            ("keyedpool_returned_total", "Objects handed back", metrics.total_returned),
            ("keyedpool_created_total", "Objects created", metrics.total_created),
            ("keyedpool_destroyed_total", "Objects destroyed", metrics.total_destroyed),
            (
                "keyedpool_evicted_total",
                "Objects destroyed by eviction sweeps",
                metrics.destroyed_by_evictor,
            ),
            (
                "keyedpool_validation_failures_total",
                "Validation failures",
                metrics.validation_failures,
            ),
            (
                "keyedpool_exhausted_total",
                "Borrows that found the pool exhausted",
                metrics.exhausted_events,
            ),
            (
                "keyedpool_borrow_timeouts_total",
                "Blocking borrows that timed out",
                metrics.borrow_timeouts,
            ),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help))?;
            counter.inc_by(value as u64);
            registry.register(Box::new(counter))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Why an object was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DestroyCause {
    Evicted,
    BorrowValidation,
    Discarded,
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    borrowed: AtomicUsize,
    returned: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    destroyed_by_evictor: AtomicUsize,
    destroyed_on_borrow_validation: AtomicUsize,
    validation_failures: AtomicUsize,
    exhausted_events: AtomicUsize,
    borrow_timeouts: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_borrowed(&self) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_returned(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self, cause: DestroyCause) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        match cause {
            DestroyCause::Evicted => {
                self.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
            }
            DestroyCause::BorrowValidation => {
                self.destroyed_on_borrow_validation.fetch_add(1, Ordering::Relaxed);
            }
            DestroyCause::Discarded => {}
        }
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.exhausted_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.borrow_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(
        &self,
        active: usize,
        idle: usize,
        keys: usize,
        max_total: Option<usize>,
    ) -> PoolMetrics {
        let utilization = match max_total {
            Some(max) if max > 0 => (active + idle) as f64 / max as f64,
            _ => 0.0,
        };

        PoolMetrics {
            total_borrowed: self.borrowed.load(Ordering::Relaxed),
            total_returned: self.returned.load(Ordering::Relaxed),
            total_created: self.created.load(Ordering::Relaxed),
            total_destroyed: self.destroyed.load(Ordering::Relaxed),
            destroyed_by_evictor: self.destroyed_by_evictor.load(Ordering::Relaxed),
            destroyed_on_borrow_validation: self
                .destroyed_on_borrow_validation
                .load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            exhausted_events: self.exhausted_events.load(Ordering::Relaxed),
            borrow_timeouts: self.borrow_timeouts.load(Ordering::Relaxed),
            active_objects: active,
            idle_objects: idle,
            keys,
            utilization,
        }
    }
}
