//! Lease acquisition against the remote store.

use std::time::{Duration, Instant};

use herdcache_config::LockConfig;
use tokio_util::sync::CancellationToken;

use super::{LeaseHandle, held};
use crate::error::{CacheError, Result};
use crate::lease::{Lease, generate_token};
use crate::metrics;
use crate::store::{DynStore, deadline_after};

/// Shortest pause between acquisition attempts.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Why an acquisition window closed without a lease.
#[derive(Debug)]
pub(crate) enum LeaseMiss {
    /// Another holder kept the lease for the whole window
    Contended,
    /// The last attempt failed on the store
    Store(CacheError),
}

/// Acquires, inspects and force-releases leases.
///
/// Acquisition is a polling spin-wait: lease timeouts are short and contention
/// is expected to be brief, so there is no wait queue.
#[derive(Clone)]
pub struct LockProvider {
    store: DynStore,
    prefix: String,
    max_poll_interval: Duration,
}

impl LockProvider {
    pub fn new(store: DynStore, config: &LockConfig) -> Self {
        Self {
            store,
            prefix: config.prefix.clone(),
            max_poll_interval: config.max_poll_interval(),
        }
    }

    /// Store key for the lease protecting `key`.
    #[inline]
    pub fn lock_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Try to take the lease on `key` within `acquire_timeout`.
    ///
    /// Returns `Ok(None)` when the window closed without a lease, whether the
    /// lease stayed contended or the store kept failing. Errors only on
    /// cancellation or when the current task already holds this lease.
    pub async fn try_acquire(
        &self,
        key: &str,
        lease_timeout: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LeaseHandle>> {
        Ok(self
            .poll_acquire(key, lease_timeout, acquire_timeout, cancel)
            .await?
            .ok())
    }

    /// Like [`try_acquire`](Self::try_acquire) but a closed window is an error:
    /// [`CacheError::LockTimeout`] when contended, the last store error otherwise.
    pub async fn acquire(
        &self,
        key: &str,
        lease_timeout: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LeaseHandle> {
        match self
            .poll_acquire(key, lease_timeout, acquire_timeout, cancel)
            .await?
        {
            Ok(lease) => Ok(lease),
            Err(LeaseMiss::Contended) => Err(CacheError::LockTimeout {
                key: key.to_string(),
                waited: acquire_timeout,
            }),
            Err(LeaseMiss::Store(e)) => Err(e),
        }
    }

    /// Poll `SET NX` until the lease is taken or the window closes.
    ///
    /// Store errors are retried like contention; only the outcome of the last
    /// attempt decides how a closed window is reported.
    pub(crate) async fn poll_acquire(
        &self,
        key: &str,
        lease_timeout: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<LeaseHandle, LeaseMiss>> {
        let lock_key = self.lock_key(key);
        if held::is_held_by_current_task(&lock_key) {
            return Err(CacheError::ReentrantLock(lock_key));
        }

        let token = generate_token();
        let deadline = deadline_after(acquire_timeout);
        let mut attempts: u32 = 0;
        let mut last_error: Option<CacheError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            attempts += 1;
            match self
                .store
                .set_if_absent(&lock_key, &token, lease_timeout)
                .await
            {
                Ok(true) => {
                    tracing::debug!(lock_key = %lock_key, attempts, "lease acquired");
                    metrics::record_lease_acquired();
                    let lease = Lease::new(key, lock_key, token, lease_timeout);
                    return Ok(Ok(LeaseHandle::new(lease, self.store.clone())));
                }
                Ok(false) => last_error = None,
                Err(e) => {
                    tracing::debug!(
                        lock_key = %lock_key,
                        attempts,
                        error = %e,
                        "lease attempt failed on store error"
                    );
                    last_error = Some(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::record_lease_timeout();
                let miss = match last_error {
                    Some(e) => {
                        tracing::warn!(
                            lock_key = %lock_key,
                            attempts,
                            error = %e,
                            "lease window closed on store errors"
                        );
                        LeaseMiss::Store(e)
                    }
                    None => {
                        tracing::debug!(
                            lock_key = %lock_key,
                            attempts,
                            "lease contended, giving up"
                        );
                        LeaseMiss::Contended
                    }
                };
                return Ok(Err(miss));
            }

            let pause = ((deadline - now) / 4)
                .min(self.max_poll_interval)
                .max(MIN_POLL_INTERVAL);
            tokio::select! {
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Check whether anyone currently holds the lease on `key`.
    pub async fn is_held(&self, key: &str) -> bool {
        let lock_key = self.lock_key(key);
        match self.store.exists(&lock_key).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(lock_key = %lock_key, error = %e, "lease lookup failed");
                false
            }
        }
    }

    /// Remove the lease on `key` regardless of who holds it.
    ///
    /// Administrative override; the holder's later release will report `false`.
    pub async fn force_release(&self, key: &str) -> bool {
        let lock_key = self.lock_key(key);
        match self.store.delete(&lock_key).await {
            Ok(removed) => {
                if removed {
                    tracing::warn!(lock_key = %lock_key, "lease force-released");
                }
                removed
            }
            Err(e) => {
                tracing::warn!(lock_key = %lock_key, error = %e, "lease force-release failed");
                false
            }
        }
    }
}
