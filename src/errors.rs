//! Error types for the keyed object pool

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type returned by [`KeyedResourceFactory`](crate::KeyedResourceFactory) hooks
pub type FactoryError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The factory hook that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryOperation {
    Create,
    Activate,
    Passivate,
    Destroy,
}

impl fmt::Display for FactoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FactoryOperation::Create => "create",
            FactoryOperation::Activate => "activate",
            FactoryOperation::Passivate => "passivate",
            FactoryOperation::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Pool capacity exhausted - no idle object and no room to create one")]
    CapacityExhausted,

    #[error("Timed out after {0:?} waiting for an idle object")]
    BorrowTimeout(Duration),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Resource factory failed to {operation}: {source}")]
    Factory {
        operation: FactoryOperation,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Returned object is not tracked by this pool")]
    InvalidReturn,

    #[error("Operation was cancelled")]
    Cancelled,
}

impl PoolError {
    pub(crate) fn factory(operation: FactoryOperation, source: FactoryError) -> Self {
        PoolError::Factory {
            operation,
            source: Arc::from(source),
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
