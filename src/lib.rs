//! # Keyed object pool
//!
//! Thread-safe pool of expensive resources partitioned by key. Borrowers get
//! an idle resource when one is available, a freshly created one when the
//! per-key and global limits allow it, and otherwise fail, wait or grow past
//! the limits depending on the configured [`WhenExhaustedAction`].
//!
//! ## Features
//!
//! - Per-key locking; unrelated keys never contend
//! - `max_active` per key and `max_total` across keys
//! - FAIL / BLOCK / GROW exhaustion policies, FIFO wake order for blocked borrowers
//! - LIFO or FIFO idle selection
//! - Validation on borrow, on return and while idle
//! - Background evictor with idle-age eviction and `min_idle` maintenance
//! - Automatic return of objects via RAII (Drop trait)
//! - Metrics and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use keyed_objectpool::{FactoryError, KeyedObjectPool, KeyedPoolConfig};
//!
//! let pool: KeyedObjectPool<&str, Vec<u8>> = KeyedObjectPool::new(
//!     |_: &&str| -> Result<Vec<u8>, FactoryError> { Ok(Vec::with_capacity(4096)) },
//!     KeyedPoolConfig::default(),
//! );
//! {
//!     let mut buffer = pool.borrow(&"uploads").unwrap();
//!     buffer.extend_from_slice(b"hello");
//!     // Buffer automatically returned when `buffer` goes out of scope
//! }
//! assert_eq!(pool.num_idle(&"uploads"), 1);
//! ```

mod borrow;
mod config;
mod entry;
mod errors;
mod eviction;
mod factory;
mod metrics;
mod pool;
mod registry;
mod release;

pub use config::{KeyedPoolConfig, WhenExhaustedAction};
pub use errors::{FactoryError, FactoryOperation, PoolError, PoolResult};
pub use factory::{KeyedResourceFactory, PoolKey};
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use pool::{KeyedObjectPool, KeyedObjectPoolFactory, PooledObject};
