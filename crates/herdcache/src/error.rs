//! Error types for cache and lease operations

use std::time::Duration;

use thiserror::Error;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur inside the cache layer
#[derive(Debug, Error)]
pub enum CacheError {
    /// Remote store unreachable (connection refused, dropped, timed out)
    #[error("Remote store unavailable: {0}")]
    StoreUnavailable(String),

    /// Remote store answered with an error
    #[error("Remote store error: {0}")]
    Store(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Lease was contended for the whole acquisition window
    #[error("Timed out acquiring lease on {key} after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    /// The current task already holds the lease it is asking for
    #[error("Lease {0} is already held by the current task")]
    ReentrantLock(String),

    /// Caller-supplied factory failed
    #[error("Factory error: {0}")]
    Factory(#[source] anyhow::Error),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation failed in transparent mode; carries the key and operation
    #[error("{operation} failed for key {key}: {source}")]
    Operation {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// Wrap an error with the operation and key it occurred under.
    pub fn with_context(self, operation: &'static str, key: impl Into<String>) -> Self {
        match self {
            // Already wrapped once, keep the innermost context
            err @ CacheError::Operation { .. } => err,
            err => CacheError::Operation {
                operation,
                key: key.into(),
                source: Box::new(err),
            },
        }
    }

    /// Strip any context wrapper.
    pub fn root(&self) -> &CacheError {
        match self {
            CacheError::Operation { source, .. } => source.root(),
            err => err,
        }
    }

    /// Check if this error means the remote store could not be reached
    pub fn is_unavailable(&self) -> bool {
        matches!(self.root(), CacheError::StoreUnavailable(_))
    }

    /// Check if this error is a lease acquisition timeout
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self.root(), CacheError::LockTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), CacheError::Cancelled)
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
        {
            CacheError::StoreUnavailable(e.to_string())
        } else {
            CacheError::Store(e.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        CacheError::StoreUnavailable(format!("failed to get Redis connection: {e}"))
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
