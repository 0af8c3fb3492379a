//! Handle returned to the caller that won a lease.

use std::future::Future;
use std::time::Duration;

use crate::lease::Lease;
use crate::metrics;
use crate::store::DynStore;

use super::held;

/// Owned lease. Only this handle's token can release or extend it.
///
/// Dropping a handle that was never released (early return, `?`, a cancelled
/// future) schedules a token-checked release on the current Tokio runtime. If
/// there is no runtime the lease is left to expire in the store.
pub struct LeaseHandle {
    lease: Lease,
    store: DynStore,
    released: bool,
}

impl LeaseHandle {
    pub(crate) fn new(lease: Lease, store: DynStore) -> Self {
        Self {
            lease,
            store,
            released: false,
        }
    }

    /// Logical key the lease protects.
    pub fn key(&self) -> &str {
        self.lease.key()
    }

    /// Namespaced key the lease is stored under.
    pub fn lock_key(&self) -> &str {
        self.lease.lock_key()
    }

    pub fn token(&self) -> &str {
        self.lease.token()
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Not yet released and not past its expiry by the local clock.
    ///
    /// Advisory only: the store is not consulted.
    pub fn is_valid(&self) -> bool {
        !self.released && !self.lease.is_expired()
    }

    /// Release the lease if this handle's token still owns it.
    ///
    /// Returns `false` when the lease was already released, had expired and was
    /// taken by someone else, or the store could not be reached.
    pub async fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        match self
            .store
            .delete_if_equals(self.lease.lock_key(), self.lease.token())
            .await
        {
            Ok(true) => {
                tracing::debug!(lock_key = %self.lease.lock_key(), "lease released");
                metrics::record_lease_released();
                true
            }
            Ok(false) => {
                tracing::warn!(
                    lock_key = %self.lease.lock_key(),
                    "lease no longer owned at release"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    lock_key = %self.lease.lock_key(),
                    error = %e,
                    "lease release failed, leaving it to expire"
                );
                false
            }
        }
    }

    /// Push the lease expiry to `duration` from now if this handle still owns it.
    pub async fn extend(&mut self, duration: Duration) -> bool {
        if self.released {
            return false;
        }

        match self
            .store
            .expire_if_equals(self.lease.lock_key(), self.lease.token(), duration)
            .await
        {
            Ok(true) => {
                self.lease.renew(duration);
                tracing::debug!(
                    lock_key = %self.lease.lock_key(),
                    ttl_ms = duration.as_millis() as u64,
                    "lease extended"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    lock_key = %self.lease.lock_key(),
                    "lease no longer owned at extend"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    lock_key = %self.lease.lock_key(),
                    error = %e,
                    "lease extend failed"
                );
                false
            }
        }
    }

    /// Run `fut` while marking this lease as held by the current task.
    ///
    /// A nested acquisition of the same key inside `fut` fails fast with
    /// [`CacheError::ReentrantLock`](crate::CacheError::ReentrantLock).
    pub async fn hold_during<F: Future>(&self, fut: F) -> F::Output {
        held::holding(self.lease.lock_key(), fut).await
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let lock_key = self.lease.lock_key().to_string();
        let token = self.lease.token().to_string();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match store.delete_if_equals(&lock_key, &token).await {
                        Ok(released) => {
                            tracing::debug!(
                                lock_key = %lock_key,
                                released,
                                "lease released on drop"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                lock_key = %lock_key,
                                error = %e,
                                "lease release on drop failed"
                            );
                        }
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    lock_key = %lock_key,
                    "lease dropped outside a runtime, leaving it to expire"
                );
            }
        }
    }
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish()
    }
}
