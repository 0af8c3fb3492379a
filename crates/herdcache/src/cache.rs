//! Cache orchestrator: local tier, remote tier, leases and fallbacks.
//!
//! ## Lookup Order
//!
//! ```text
//! get_or_set(key)
//!   → local tier ─hit→ return
//!   → remote tier ─hit→ back-fill local, return
//!   → lease lock:<namespace>:<key>
//!        ├─ acquired → re-check tiers → factory → write both tiers → release
//!        └─ contended → factory without the lease (or fallback ladder)
//! ```
//!
//! ## Error Modes
//!
//! With errors hidden (the default) a failing call never returns an error from
//! the cache layer itself: it walks the fallback ladder in [`crate::fallback`].
//! In transparent mode errors are returned wrapped with the key and operation.
//! Cancellation is always returned as [`CacheError::Cancelled`].

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use herdcache_config::{AppConfig, CacheConfig, LockConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};
use crate::fallback;
use crate::local::LocalCache;
use crate::lock::{LeaseMiss, LockProvider};
use crate::metrics;
use crate::options::{self, CacheOptions};
use crate::serializer::Serializer;
use crate::store::{self, DynStore};

/// Reserved hash field holding the build time in unix milliseconds.
pub const CACHE_TIMESTAMP_FIELD: &str = "cache_timestamp";

/// Field map cached as one hash entry.
pub type HashFields = HashMap<String, String>;

/// Bounds for values stored through the orchestrator.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

impl<T> CacheValue for T where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static
{
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub local_entries: usize,
    pub mode: String,
}

/// Options resolved against the engine configuration for one call.
struct Policy {
    use_local: bool,
    use_remote: bool,
    ttl: Duration,
    local_ttl: Duration,
    lock_enabled: bool,
    lease_timeout: Duration,
    acquire_timeout: Duration,
    fallback_to_factory: bool,
    hide_errors: bool,
    cancel: CancellationToken,
}

/// Distributed cache-aside engine.
#[derive(Clone)]
pub struct DistributedCache {
    store: DynStore,
    local: LocalCache,
    locks: LockProvider,
    serializer: Serializer,
    cache_config: CacheConfig,
    lock_config: LockConfig,
}

impl DistributedCache {
    /// Create an orchestrator over an existing store.
    pub fn new(store: DynStore, config: &AppConfig) -> Self {
        Self {
            locks: LockProvider::new(store.clone(), &config.lock),
            local: LocalCache::new(config.cache.local_max_entries),
            serializer: Serializer::new(&config.serializer),
            cache_config: config.cache.clone(),
            lock_config: config.lock.clone(),
            store,
        }
    }

    /// Connect to the configured store (degrading to in-process) and build the orchestrator.
    pub async fn connect(config: &AppConfig) -> Self {
        let store = store::connect(&config.redis).await;
        Self::new(store, config)
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn lock_provider(&self) -> &LockProvider {
        &self.locks
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Store key for a logical key: `<namespace>:<key>`.
    #[inline]
    pub fn cache_key(&self, key: &str) -> String {
        format!("{}:{key}", self.cache_config.namespace)
    }

    fn policy<T>(&self, opts: &CacheOptions<T>) -> Policy {
        let ttl = options::base_ttl(opts.ttl, self.cache_config.default_ttl());
        Policy {
            use_local: opts.use_local.unwrap_or(self.cache_config.local_enabled),
            use_remote: opts.use_remote.unwrap_or(self.cache_config.remote_enabled),
            ttl,
            local_ttl: options::local_ttl(opts.local_ttl, ttl),
            lock_enabled: opts.lock_enabled.unwrap_or(self.lock_config.enabled),
            lease_timeout: opts
                .lease_timeout
                .filter(|t| !t.is_zero())
                .unwrap_or_else(|| self.lock_config.lease_timeout()),
            acquire_timeout: opts
                .acquire_timeout
                .unwrap_or_else(|| self.lock_config.acquire_timeout()),
            fallback_to_factory: opts
                .fallback_to_factory
                .unwrap_or(self.lock_config.fallback_to_factory),
            hide_errors: opts.hide_errors.unwrap_or(self.cache_config.hide_errors),
            cancel: opts.cancel.clone().unwrap_or_default(),
        }
    }

    // =========================================================================
    // Scalar entries
    // =========================================================================

    /// Read `key`, returning the default value on a miss.
    pub async fn get<T: CacheValue>(&self, key: &str, opts: &CacheOptions<T>) -> Result<T> {
        let policy = self.policy(opts);
        let full_key = self.cache_key(key);
        match cancellable(&policy.cancel, self.lookup::<T>(&full_key, &policy)).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Ok(opts.default_value.clone().unwrap_or_default()),
            Err(e) => self.recover(e, key, "get", &policy, opts),
        }
    }

    /// Read `key`, distinguishing a miss from a stored value.
    ///
    /// With errors hidden, a failure yields the fallback ladder's value, or
    /// `None` when every rung came up empty.
    pub async fn try_get<T: CacheValue>(
        &self,
        key: &str,
        opts: &CacheOptions<T>,
    ) -> Result<Option<T>> {
        let policy = self.policy(opts);
        let full_key = self.cache_key(key);
        match cancellable(&policy.cancel, self.lookup::<T>(&full_key, &policy)).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_cancelled() => Err(CacheError::Cancelled),
            Err(e) if policy.hide_errors => {
                Ok(fallback::resolve(opts, key, "try_get", &e).into_option())
            }
            Err(e) => Err(e.with_context("try_get", key)),
        }
    }

    /// Write `value` to every enabled tier.
    pub async fn set<T: CacheValue>(
        &self,
        key: &str,
        value: &T,
        opts: &CacheOptions<T>,
    ) -> Result<()> {
        let policy = self.policy(opts);
        let full_key = self.cache_key(key);
        match cancellable(
            &policy.cancel,
            self.store_value(&full_key, value, &policy, opts),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(CacheError::Cancelled),
            Err(e) if policy.hide_errors => {
                tracing::warn!(key = %key, error = %e, "cache set failed");
                Ok(())
            }
            Err(e) => Err(e.with_context("set", key)),
        }
    }

    /// Return the cached value for `key`, building it with `factory` on a miss.
    ///
    /// With locking enabled, concurrent callers across processes run the
    /// factory once per miss window; the rest wait on the lease and read the
    /// value the winner wrote.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        opts: &CacheOptions<T>,
    ) -> Result<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        self.get_or_build(&Scalar::<T>::new(), key, factory, opts, "get_or_set")
            .await
    }

    async fn lookup<T: CacheValue>(&self, full_key: &str, policy: &Policy) -> Result<Option<T>> {
        if policy.use_local {
            if let Some(data) = self.local.get(full_key) {
                match self.serializer.from_bytes::<T>(&data) {
                    Ok(value) => {
                        tracing::debug!(key = %full_key, "cache hit (local)");
                        metrics::record_cache_hit("local");
                        return Ok(Some(value));
                    }
                    Err(e) => {
                        tracing::warn!(
                            key = %full_key,
                            error = %e,
                            "undecodable local entry dropped"
                        );
                        self.local.remove(full_key);
                    }
                }
            }
        }

        if policy.use_remote {
            if let Some(payload) = self.store.get(full_key).await? {
                let value: T = self.serializer.decode(&payload)?;
                tracing::debug!(key = %full_key, "cache hit (remote)");
                metrics::record_cache_hit("remote");
                if policy.use_local {
                    self.local.insert(
                        full_key,
                        self.serializer.to_bytes(&value)?,
                        policy.local_ttl,
                    );
                }
                return Ok(Some(value));
            }
        }

        tracing::debug!(key = %full_key, "cache miss");
        metrics::record_cache_miss();
        Ok(None)
    }

    async fn store_value<T: CacheValue>(
        &self,
        full_key: &str,
        value: &T,
        policy: &Policy,
        opts: &CacheOptions<T>,
    ) -> Result<()> {
        let remote_ttl =
            options::remote_ttl(full_key, policy.ttl, value, opts.ttl_adjuster.as_ref());

        if policy.use_local {
            self.local
                .insert(full_key, self.serializer.to_bytes(value)?, policy.local_ttl);
        }
        if policy.use_remote {
            let payload = self.serializer.encode(value)?;
            self.store.set(full_key, &payload, remote_ttl).await?;
        }

        tracing::debug!(
            key = %full_key,
            remote_ttl_ms = remote_ttl.as_millis() as u64,
            local_ttl_ms = policy.local_ttl.as_millis() as u64,
            "cache set"
        );
        Ok(())
    }

    // =========================================================================
    // Hash entries
    // =========================================================================

    /// Read the hash at `key` if present and fresh.
    ///
    /// Freshness is judged by the entry's `cache_timestamp` against the base
    /// TTL, not by the store's own expiry.
    pub async fn hash_get(
        &self,
        key: &str,
        opts: &CacheOptions<HashFields>,
    ) -> Result<Option<HashFields>> {
        let policy = self.policy(opts);
        let full_key = self.cache_key(key);
        match cancellable(&policy.cancel, self.lookup_hash(&full_key, &policy)).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_cancelled() => Err(CacheError::Cancelled),
            Err(e) if policy.hide_errors => {
                Ok(fallback::resolve(opts, key, "hash_get", &e).into_option())
            }
            Err(e) => Err(e.with_context("hash_get", key)),
        }
    }

    /// Hash variant of [`get_or_set`](Self::get_or_set).
    ///
    /// The factory's map is stamped with `cache_timestamp`, passed whole to the
    /// TTL adjuster and written as one entry. The returned map never contains
    /// the reserved field.
    pub async fn hash_get_or_set<F, Fut>(
        &self,
        key: &str,
        factory: F,
        opts: &CacheOptions<HashFields>,
    ) -> Result<HashFields>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<HashFields>> + Send,
    {
        self.get_or_build(&Hash, key, factory, opts, "hash_get_or_set")
            .await
    }

    async fn lookup_hash(&self, full_key: &str, policy: &Policy) -> Result<Option<HashFields>> {
        let now = now_millis();

        if policy.use_local {
            if let Some(data) = self.local.get(full_key) {
                match self.serializer.from_bytes::<HashFields>(&data) {
                    Ok(fields) if is_fresh(&fields, policy.ttl, now) => {
                        tracing::debug!(key = %full_key, "hash hit (local)");
                        metrics::record_cache_hit("local");
                        return Ok(Some(strip_timestamp(fields)));
                    }
                    Ok(_) => {
                        tracing::debug!(key = %full_key, "stale local hash dropped");
                        self.local.remove(full_key);
                    }
                    Err(e) => {
                        tracing::warn!(
                            key = %full_key,
                            error = %e,
                            "undecodable local hash dropped"
                        );
                        self.local.remove(full_key);
                    }
                }
            }
        }

        if policy.use_remote {
            let fields = self.store.hash_get_all(full_key).await?;
            if !fields.is_empty() {
                if is_fresh(&fields, policy.ttl, now) {
                    tracing::debug!(key = %full_key, "hash hit (remote)");
                    metrics::record_cache_hit("remote");
                    if policy.use_local {
                        self.local.insert(
                            full_key,
                            self.serializer.to_bytes(&fields)?,
                            policy.local_ttl,
                        );
                    }
                    return Ok(Some(strip_timestamp(fields)));
                }
                tracing::debug!(key = %full_key, "stale remote hash");
            }
        }

        tracing::debug!(key = %full_key, "hash miss");
        metrics::record_cache_miss();
        Ok(None)
    }

    async fn store_hash(
        &self,
        full_key: &str,
        stamped: &HashFields,
        policy: &Policy,
        opts: &CacheOptions<HashFields>,
    ) -> Result<()> {
        let remote_ttl =
            options::remote_ttl(full_key, policy.ttl, stamped, opts.ttl_adjuster.as_ref());

        if policy.use_local {
            self.local
                .insert(full_key, self.serializer.to_bytes(stamped)?, policy.local_ttl);
        }
        if policy.use_remote {
            self.store.hash_replace(full_key, stamped, remote_ttl).await?;
        }

        tracing::debug!(
            key = %full_key,
            fields = stamped.len(),
            remote_ttl_ms = remote_ttl.as_millis() as u64,
            "hash set"
        );
        Ok(())
    }

    // =========================================================================
    // Compute-and-cache
    // =========================================================================

    async fn get_or_build<K, F, Fut>(
        &self,
        kind: &K,
        key: &str,
        factory: F,
        opts: &CacheOptions<K::Value>,
        operation: &'static str,
    ) -> Result<K::Value>
    where
        K: EntryKind,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<K::Value>> + Send,
    {
        let policy = self.policy(opts);
        let full_key = self.cache_key(key);
        match cancellable(
            &policy.cancel,
            self.build(kind, &full_key, factory, &policy, opts),
        )
        .await
        {
            Ok(value) => Ok(value),
            Err(e) => self.recover(e, key, operation, &policy, opts),
        }
    }

    async fn build<K, F, Fut>(
        &self,
        kind: &K,
        full_key: &str,
        factory: F,
        policy: &Policy,
        opts: &CacheOptions<K::Value>,
    ) -> Result<K::Value>
    where
        K: EntryKind,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<K::Value>> + Send,
    {
        if let Some(value) = kind.lookup(self, full_key, policy).await? {
            return Ok(value);
        }

        if !policy.lock_enabled {
            let built = run_factory(factory).await?;
            let persisted = kind.persist(self, full_key, built, policy, opts).await;
            return self.keep_written(persisted, full_key, policy);
        }

        let lease = self
            .locks
            .poll_acquire(
                full_key,
                policy.lease_timeout,
                policy.acquire_timeout,
                &policy.cancel,
            )
            .await?;

        match lease {
            Ok(mut lease) => {
                let outcome = lease
                    .hold_during(self.build_under_lease(kind, full_key, factory, policy, opts))
                    .await;
                lease.release().await;
                outcome
            }
            Err(miss) if policy.fallback_to_factory => {
                match &miss {
                    LeaseMiss::Contended => {
                        tracing::warn!(key = %full_key, "lease unavailable, building without it");
                    }
                    LeaseMiss::Store(e) => {
                        tracing::warn!(
                            key = %full_key,
                            error = %e,
                            "lease store failing, building without a lease"
                        );
                    }
                }
                metrics::record_fallback("factory");
                let built = run_factory(factory).await?;
                let (value, written) = kind.persist(self, full_key, built, policy, opts).await;
                if let Err(e) = written {
                    tracing::warn!(key = %full_key, error = %e, "best-effort cache write failed");
                }
                Ok(value)
            }
            Err(LeaseMiss::Contended) => Err(CacheError::LockTimeout {
                key: full_key.to_string(),
                waited: policy.acquire_timeout,
            }),
            Err(LeaseMiss::Store(e)) => Err(e),
        }
    }

    async fn build_under_lease<K, F, Fut>(
        &self,
        kind: &K,
        full_key: &str,
        factory: F,
        policy: &Policy,
        opts: &CacheOptions<K::Value>,
    ) -> Result<K::Value>
    where
        K: EntryKind,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<K::Value>> + Send,
    {
        // Another holder may have filled the cache while we waited for the lease
        if let Some(value) = kind.lookup(self, full_key, policy).await? {
            return Ok(value);
        }
        let built = run_factory(factory).await?;
        self.keep_written(
            kind.persist(self, full_key, built, policy, opts).await,
            full_key,
            policy,
        )
    }

    /// A freshly built value survives a failed cache write when errors are hidden.
    fn keep_written<V>(
        &self,
        (value, written): (V, Result<()>),
        full_key: &str,
        policy: &Policy,
    ) -> Result<V> {
        match written {
            Ok(()) => Ok(value),
            Err(e) if policy.hide_errors => {
                tracing::warn!(
                    key = %full_key,
                    error = %e,
                    "cache write failed, returning built value"
                );
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    fn recover<T: Clone + Default>(
        &self,
        error: CacheError,
        key: &str,
        operation: &'static str,
        policy: &Policy,
        opts: &CacheOptions<T>,
    ) -> Result<T> {
        if error.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        if !policy.hide_errors {
            return Err(error.with_context(operation, key));
        }
        Ok(fallback::resolve(opts, key, operation, &error).into_value())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete `key` from both tiers.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let full_key = self.cache_key(key);
        let local_removed = self.local.remove(&full_key);
        if !self.cache_config.remote_enabled {
            return Ok(local_removed);
        }
        match self.store.delete(&full_key).await {
            Ok(remote_removed) => {
                tracing::debug!(key = %full_key, "cache entry removed");
                Ok(local_removed || remote_removed)
            }
            Err(e) if self.cache_config.hide_errors => {
                tracing::warn!(key = %full_key, error = %e, "remote delete failed");
                Ok(local_removed)
            }
            Err(e) => Err(e.with_context("remove", key)),
        }
    }

    /// Check whether `key` is cached in either tier.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.cache_key(key);
        if self.cache_config.local_enabled && self.local.contains(&full_key) {
            return Ok(true);
        }
        if !self.cache_config.remote_enabled {
            return Ok(false);
        }
        match self.store.exists(&full_key).await {
            Ok(found) => Ok(found),
            Err(e) if self.cache_config.hide_errors => {
                tracing::warn!(key = %full_key, error = %e, "remote exists failed");
                Ok(false)
            }
            Err(e) => Err(e.with_context("exists", key)),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_entries: self.local.len(),
            mode: self.store.mode().to_string(),
        }
    }

    /// Check if the remote store answers (for health checks).
    pub async fn is_remote_available(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}

/// How one kind of entry is read from and written to the tiers.
#[async_trait]
trait EntryKind: Send + Sync {
    type Value: Clone + Default + Send + Sync + 'static;

    async fn lookup(
        &self,
        cache: &DistributedCache,
        full_key: &str,
        policy: &Policy,
    ) -> Result<Option<Self::Value>>;

    /// Write a freshly built value; returns what the caller receives and the write outcome.
    async fn persist(
        &self,
        cache: &DistributedCache,
        full_key: &str,
        value: Self::Value,
        policy: &Policy,
        opts: &CacheOptions<Self::Value>,
    ) -> (Self::Value, Result<()>);
}

struct Scalar<T>(PhantomData<fn() -> T>);

impl<T> Scalar<T> {
    fn new() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T: CacheValue> EntryKind for Scalar<T> {
    type Value = T;

    async fn lookup(
        &self,
        cache: &DistributedCache,
        full_key: &str,
        policy: &Policy,
    ) -> Result<Option<T>> {
        cache.lookup::<T>(full_key, policy).await
    }

    async fn persist(
        &self,
        cache: &DistributedCache,
        full_key: &str,
        value: T,
        policy: &Policy,
        opts: &CacheOptions<T>,
    ) -> (T, Result<()>) {
        let written = cache.store_value(full_key, &value, policy, opts).await;
        (value, written)
    }
}

struct Hash;

#[async_trait]
impl EntryKind for Hash {
    type Value = HashFields;

    async fn lookup(
        &self,
        cache: &DistributedCache,
        full_key: &str,
        policy: &Policy,
    ) -> Result<Option<HashFields>> {
        cache.lookup_hash(full_key, policy).await
    }

    async fn persist(
        &self,
        cache: &DistributedCache,
        full_key: &str,
        mut value: HashFields,
        policy: &Policy,
        opts: &CacheOptions<HashFields>,
    ) -> (HashFields, Result<()>) {
        value.insert(CACHE_TIMESTAMP_FIELD.to_string(), now_millis().to_string());
        let written = cache.store_hash(full_key, &value, policy, opts).await;
        (strip_timestamp(value), written)
    }
}

async fn run_factory<T, F, Fut>(factory: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    metrics::record_factory_run();
    factory().await.map_err(CacheError::Factory)
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CacheError::Cancelled),
        result = fut => result,
    }
}

fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// A hash is fresh while its stamp is within one base TTL of `now_ms`.
///
/// The distance is taken in both directions so a stamp from a writer whose
/// clock runs ahead cannot keep an entry alive past one TTL.
pub fn is_fresh(fields: &HashFields, ttl: Duration, now_ms: i64) -> bool {
    let Some(stamp) = fields
        .get(CACHE_TIMESTAMP_FIELD)
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return false;
    };
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_sub(stamp).unsigned_abs() < ttl_ms
}

fn strip_timestamp(mut fields: HashFields) -> HashFields {
    fields.remove(CACHE_TIMESTAMP_FIELD);
    fields
}
