//! Pool configuration options

use std::time::Duration;

/// What a borrow does when neither an idle object nor capacity is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WhenExhaustedAction {
    /// Return [`PoolError::CapacityExhausted`](crate::PoolError::CapacityExhausted) immediately
    Fail,

    /// Wait for a returned object, up to `max_wait`
    #[default]
    Block,

    /// Create a new object past the configured limits
    Grow,
}

/// Configuration for keyed pool behavior
///
/// `None` limits are unbounded. The defaults are:
///
/// | field | default |
/// |---|---|
/// | `max_active` | `Some(8)` |
/// | `max_total` | `None` |
/// | `max_idle` | `Some(8)` |
/// | `min_idle` | `0` |
/// | `max_wait` | `None` (wait indefinitely) |
/// | `when_exhausted_action` | `Block` |
/// | `lifo` | `true` |
/// | `test_on_borrow`, `test_on_return`, `test_while_idle` | `false` |
/// | `time_between_eviction_runs` | `None` (no evictor thread) |
/// | `num_tests_per_eviction_run` | `3` |
/// | `min_evictable_idle_time` | `Some(30 min)` |
///
/// # Examples
///
/// ```
/// use keyed_objectpool::{KeyedPoolConfig, WhenExhaustedAction};
/// use std::time::Duration;
///
/// let config = KeyedPoolConfig::new()
///     .with_max_active(1)
///     .with_max_wait(Duration::from_millis(3))
///     .with_when_exhausted_action(WhenExhaustedAction::Grow);
///
/// assert_eq!(config.max_active, Some(1));
/// assert_eq!(config.max_wait, Some(Duration::from_millis(3)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KeyedPoolConfig {
    /// Maximum objects per key, borrowed plus idle
    pub max_active: Option<usize>,

    /// Maximum objects across all keys, borrowed plus idle
    pub max_total: Option<usize>,

    /// Maximum idle objects retained per key
    pub max_idle: Option<usize>,

    /// Idle objects the evictor keeps per key
    pub min_idle: usize,

    /// How long a `Block` borrow waits
    pub max_wait: Option<Duration>,

    pub when_exhausted_action: WhenExhaustedAction,

    /// Hand out the most recently returned idle object first
    pub lifo: bool,

    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,

    /// Evictor period
    pub time_between_eviction_runs: Option<Duration>,

    /// Idle objects visited per sweep; negative means `ceil(idle / |n|)`
    pub num_tests_per_eviction_run: i32,

    /// Idle time after which the evictor may destroy an object
    pub min_evictable_idle_time: Option<Duration>,
}

impl Default for KeyedPoolConfig {
    fn default() -> Self {
        Self {
            max_active: Some(8),
            max_total: None,
            max_idle: Some(8),
            min_idle: 0,
            max_wait: None,
            when_exhausted_action: WhenExhaustedAction::Block,
            lifo: true,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
        }
    }
}

fn positive(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

impl KeyedPoolConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = Some(max);
        self
    }

    /// Remove the per-key limit
    pub fn with_unbounded_active(mut self) -> Self {
        self.max_active = None;
        self
    }

    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = Some(max);
        self
    }

    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = Some(max);
        self
    }

    pub fn with_unbounded_idle(mut self) -> Self {
        self.max_idle = None;
        self
    }

    pub fn with_min_idle(mut self, min: usize) -> Self {
        self.min_idle = min;
        self
    }

    /// Set how long a blocking borrow waits. A zero duration waits indefinitely.
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = positive(wait);
        self
    }

    pub fn with_when_exhausted_action(mut self, action: WhenExhaustedAction) -> Self {
        self.when_exhausted_action = action;
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    pub fn with_test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }

    pub fn with_test_while_idle(mut self, test: bool) -> Self {
        self.test_while_idle = test;
        self
    }

    /// Set the evictor period. A zero period disables the evictor.
    ///
    /// # Examples
    ///
    /// ```
    /// use keyed_objectpool::KeyedPoolConfig;
    /// use std::time::Duration;
    ///
    /// let config = KeyedPoolConfig::new().with_time_between_eviction_runs(Duration::ZERO);
    /// assert_eq!(config.time_between_eviction_runs, None);
    /// ```
    pub fn with_time_between_eviction_runs(mut self, period: Duration) -> Self {
        self.time_between_eviction_runs = positive(period);
        self
    }

    pub fn with_num_tests_per_eviction_run(mut self, tests: i32) -> Self {
        self.num_tests_per_eviction_run = tests;
        self
    }

    /// Set the idle-age eviction threshold. A zero duration disables age eviction.
    pub fn with_min_evictable_idle_time(mut self, idle: Duration) -> Self {
        self.min_evictable_idle_time = positive(idle);
        self
    }

    /// Collapse zero durations to `None`, as the `with_*` builders do.
    ///
    /// Configs built as struct literals or deserialized skip the builders, so
    /// the pool applies this wherever it stores a config.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_wait = self.max_wait.and_then(positive);
        self.time_between_eviction_runs = self.time_between_eviction_runs.and_then(positive);
        self.min_evictable_idle_time = self.min_evictable_idle_time.and_then(positive);
        self
    }

    /// Idle objects kept per key by top-ups, never more than `max_idle`
    pub(crate) fn idle_target(&self) -> usize {
        self.max_idle.map_or(self.min_idle, |max| self.min_idle.min(max))
    }

    /// Number of idle objects one sweep visits when `idle` objects are parked
    pub(crate) fn tests_per_run(&self, idle: usize) -> usize {
        let tests = self.num_tests_per_eviction_run;
        if tests >= 0 {
            (tests as usize).min(idle)
        } else {
            idle.div_ceil(tests.unsigned_abs() as usize)
        }
    }

    pub(crate) fn has_key_room(&self, objects_for_key: usize) -> bool {
        self.max_active.is_none_or(|max| objects_for_key < max)
    }

    pub(crate) fn has_idle_room(&self, idle_for_key: usize) -> bool {
        self.max_idle.is_none_or(|max| idle_for_key < max)
    }
}
