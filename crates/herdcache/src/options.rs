//! Per-call cache options and TTL rules.
//!
//! Unset options inherit the engine configuration. The TTL rules:
//!
//! - base TTL: the call's `ttl`, or the configured default; a zero TTL is
//!   corrected to the configured default with a warning
//! - local TTL: the call's `local_ttl` when set and non-zero, otherwise the base TTL
//! - remote TTL: the base TTL passed through the TTL adjuster, if any; an
//!   adjuster error (or a zero result) keeps the unadjusted base TTL

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CacheError;

/// Given the base TTL and the value being stored, return the remote TTL.
pub type TtlAdjuster<T> = Arc<dyn Fn(Duration, &T) -> anyhow::Result<Duration> + Send + Sync>;

/// First rung of the fallback ladder; `Ok(None)` passes to the next rung.
pub type ErrorCallback<T> = Arc<dyn Fn(&CacheError) -> anyhow::Result<Option<T>> + Send + Sync>;

/// Third rung of the fallback ladder, called with `(key, operation)`.
pub type CustomFallback<T> = Arc<dyn Fn(&str, &str) -> anyhow::Result<T> + Send + Sync>;

/// Options for one cache call.
///
/// ```ignore
/// let opts = CacheOptions::new()
///     .ttl(Duration::from_secs(60))
///     .local_ttl(Duration::from_secs(5))
///     .default_value(User::default());
/// let user: User = cache.get_or_set("user:1", || load_user(1), &opts).await?;
/// ```
pub struct CacheOptions<T> {
    /// Use the in-process tier
    pub use_local: Option<bool>,
    /// Use the remote tier
    pub use_remote: Option<bool>,
    /// Base TTL
    pub ttl: Option<Duration>,
    /// Independent local-tier TTL; inherits the base TTL when unset
    pub local_ttl: Option<Duration>,
    pub ttl_adjuster: Option<TtlAdjuster<T>>,

    /// Protect `get_or_set` misses with a lease
    pub lock_enabled: Option<bool>,
    pub lease_timeout: Option<Duration>,
    pub acquire_timeout: Option<Duration>,
    /// Run the factory unprotected when the lease cannot be obtained
    pub fallback_to_factory: Option<bool>,

    /// Swallow errors and walk the fallback ladder
    pub hide_errors: Option<bool>,
    pub on_error: Option<ErrorCallback<T>>,
    /// Use `default_value` as a fallback rung (and as the miss value of `get`)
    pub fallback_to_default: bool,
    pub default_value: Option<T>,
    pub custom_fallback: Option<CustomFallback<T>>,

    pub cancel: Option<CancellationToken>,
}

impl<T> Default for CacheOptions<T> {
    fn default() -> Self {
        Self {
            use_local: None,
            use_remote: None,
            ttl: None,
            local_ttl: None,
            ttl_adjuster: None,
            lock_enabled: None,
            lease_timeout: None,
            acquire_timeout: None,
            fallback_to_factory: None,
            hide_errors: None,
            on_error: None,
            fallback_to_default: false,
            default_value: None,
            custom_fallback: None,
            cancel: None,
        }
    }
}

impl<T: Clone> Clone for CacheOptions<T> {
    fn clone(&self) -> Self {
        Self {
            use_local: self.use_local,
            use_remote: self.use_remote,
            ttl: self.ttl,
            local_ttl: self.local_ttl,
            ttl_adjuster: self.ttl_adjuster.clone(),
            lock_enabled: self.lock_enabled,
            lease_timeout: self.lease_timeout,
            acquire_timeout: self.acquire_timeout,
            fallback_to_factory: self.fallback_to_factory,
            hide_errors: self.hide_errors,
            on_error: self.on_error.clone(),
            fallback_to_default: self.fallback_to_default,
            default_value: self.default_value.clone(),
            custom_fallback: self.custom_fallback.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> CacheOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = Some(ttl);
        self
    }

    pub fn local_only(mut self) -> Self {
        self.use_local = Some(true);
        self.use_remote = Some(false);
        self
    }

    pub fn remote_only(mut self) -> Self {
        self.use_local = Some(false);
        self.use_remote = Some(true);
        self
    }

    pub fn use_local(mut self, enabled: bool) -> Self {
        self.use_local = Some(enabled);
        self
    }

    pub fn use_remote(mut self, enabled: bool) -> Self {
        self.use_remote = Some(enabled);
        self
    }

    pub fn adjust_ttl(
        mut self,
        f: impl Fn(Duration, &T) -> anyhow::Result<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.ttl_adjuster = Some(Arc::new(f));
        self
    }

    pub fn lock(mut self, enabled: bool) -> Self {
        self.lock_enabled = Some(enabled);
        self
    }

    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn fallback_to_factory(mut self, enabled: bool) -> Self {
        self.fallback_to_factory = Some(enabled);
        self
    }

    pub fn hide_errors(mut self, hide: bool) -> Self {
        self.hide_errors = Some(hide);
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&CacheError) -> anyhow::Result<Option<T>> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Set the default value and enable it as a fallback.
    pub fn default_value(mut self, value: T) -> Self {
        self.default_value = Some(value);
        self.fallback_to_default = true;
        self
    }

    pub fn fallback_to_default(mut self, enabled: bool) -> Self {
        self.fallback_to_default = enabled;
        self
    }

    pub fn custom_fallback(
        mut self,
        f: impl Fn(&str, &str) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.custom_fallback = Some(Arc::new(f));
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Base TTL for a call.
pub(crate) fn base_ttl(requested: Option<Duration>, system_default: Duration) -> Duration {
    match requested {
        None => system_default,
        Some(ttl) if ttl.is_zero() => {
            tracing::warn!(
                default_ttl_ms = system_default.as_millis() as u64,
                "non-positive TTL, using system default"
            );
            system_default
        }
        Some(ttl) => ttl,
    }
}

/// Local-tier TTL: explicit and non-zero, or inherited from the base TTL.
pub(crate) fn local_ttl(requested: Option<Duration>, base: Duration) -> Duration {
    match requested {
        Some(ttl) if !ttl.is_zero() => ttl,
        _ => base,
    }
}

/// Remote-tier TTL after the optional adjuster.
pub(crate) fn remote_ttl<T>(
    key: &str,
    base: Duration,
    value: &T,
    adjuster: Option<&TtlAdjuster<T>>,
) -> Duration {
    let Some(adjust) = adjuster else {
        return base;
    };
    match adjust(base, value) {
        Ok(adjusted) if !adjusted.is_zero() => adjusted,
        Ok(_) => {
            tracing::warn!(key = %key, "TTL adjuster returned zero, keeping base TTL");
            base
        }
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "TTL adjuster failed, keeping base TTL");
            base
        }
    }
}
