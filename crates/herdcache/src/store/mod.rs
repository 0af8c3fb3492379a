//! Remote key-value store abstraction.
//!
//! The cache engine only needs a handful of primitives from the shared store:
//! plain get/set/delete/exists with TTL, whole-hash reads and writes, and three
//! atomic compare-and-act operations that back the lease protocol. Every lease
//! mutation goes through one of those atomic methods; implementations must never
//! split them into a read followed by a write.
//!
//! ## Backends
//!
//! - [`RedisStore`]: `deadpool-redis` pool, Lua scripts for compare-and-act
//! - [`MemoryStore`]: in-process `DashMap`, single-instance deployments and tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use herdcache_config::RedisConfig;

use crate::error::Result;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Shared handle to a remote store.
pub type DynStore = Arc<dyn RemoteStore>;

/// Operations the cache engine performs against the shared store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend name for logs and stats ("redis", "memory").
    fn mode(&self) -> &'static str;

    /// Read raw bytes stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite `key` with `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete `key`. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read every field of the hash at `key`; empty when absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Atomically replace the hash at `key` with `fields` and set its TTL.
    async fn hash_replace(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<()>;

    /// Set `key` to `value` with `ttl` only if `key` is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if its current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the TTL of `key` only if its current value equals `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Health probe.
    async fn ping(&self) -> Result<()>;
}

/// Build the remote store described by `config`.
///
/// ## Graceful Degradation
///
/// If Redis is disabled, or the pool cannot be created or reached, this falls
/// back to an in-process [`MemoryStore`]. Leases then only exclude tasks within
/// this process.
pub async fn connect(config: &RedisConfig) -> DynStore {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process store");
        return Arc::new(MemoryStore::new());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let store = match RedisStore::from_config(config) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-process store."
            );
            return Arc::new(MemoryStore::new());
        }
    };

    match store.ping().await {
        Ok(()) => {
            tracing::info!("Connected to Redis successfully");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-process store."
            );
            Arc::new(MemoryStore::new())
        }
    }
}

/// Longest TTL or wait handed to a clock; anything longer means "forever".
pub(crate) const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Monotonic instant `after` from now, saturating at [`MAX_DURATION`].
pub(crate) fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or_else(|| now + MAX_DURATION)
}

/// Clamp a TTL to whole milliseconds, never zero (a zero expiry is rejected by Redis).
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.min(MAX_DURATION).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}
