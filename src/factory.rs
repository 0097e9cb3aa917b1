//! Resource factory contract

use std::fmt::Debug;
use std::hash::Hash;

use crate::errors::FactoryError;

/// Keys that partition a pool
pub trait PoolKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<K> PoolKey for K where K: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// Creates and maintains the resources held by a keyed pool
///
/// The pool calls these hooks without holding any of its locks. `destroy`
/// errors are logged and never reach the caller of a pool operation.
///
/// Any `Fn(&K) -> Result<T, FactoryError>` closure is a factory that only
/// knows how to create.
///
/// # Examples
///
/// ```
/// use keyed_objectpool::{FactoryError, KeyedResourceFactory};
///
/// struct Buffers;
///
/// impl KeyedResourceFactory<usize, Vec<u8>> for Buffers {
///     fn create(&self, size: &usize) -> Result<Vec<u8>, FactoryError> {
///         Ok(Vec::with_capacity(*size))
///     }
///
///     fn passivate(&self, _size: &usize, buffer: &mut Vec<u8>) -> Result<(), FactoryError> {
///         buffer.clear();
///         Ok(())
///     }
/// }
/// ```
pub trait KeyedResourceFactory<K, T>: Send + Sync {
    fn create(&self, key: &K) -> Result<T, FactoryError>;

    fn destroy(&self, _key: &K, resource: T) -> Result<(), FactoryError> {
        drop(resource);
        Ok(())
    }

    /// Whether the resource is still usable
    fn validate(&self, _key: &K, _resource: &T) -> bool {
        true
    }

    /// Called before a resource is handed to a borrower
    fn activate(&self, _key: &K, _resource: &mut T) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Called before a resource is parked in the idle queue
    fn passivate(&self, _key: &K, _resource: &mut T) -> Result<(), FactoryError> {
        Ok(())
    }
}

impl<K, T, F> KeyedResourceFactory<K, T> for F
where
    F: Fn(&K) -> Result<T, FactoryError> + Send + Sync,
{
    fn create(&self, key: &K) -> Result<T, FactoryError> {
        self(key)
    }
}
