//! Lease entity: a token-authenticated, time-bounded permit on one key.
//!
//! A lease lives in the remote store under the lock prefix, with the holder's
//! token as its value. Ownership is proven by token equality only; the store
//! expires the key after the lease timeout even if the holder crashed.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::{MAX_DURATION, deadline_after};

/// Identity of this process: `hostname:pid`.
fn process_identity() -> &'static str {
    static IDENTITY: OnceLock<String> = OnceLock::new();
    IDENTITY.get_or_init(|| {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        format!("{host}:{}", std::process::id())
    })
}

/// Generate a token unique to one acquisition attempt.
///
/// Format: `hostname:pid:uuid:unix_millis`.
pub fn generate_token() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!(
        "{}:{}:{}",
        process_identity(),
        Uuid::new_v4().simple(),
        millis
    )
}

/// A lease held against one key.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Logical key being protected
    key: String,
    /// Namespaced key the lease is stored under (`lock:<key>`)
    lock_key: String,
    /// Value written at `lock_key`
    token: String,
    acquired_at: OffsetDateTime,
    /// Absolute expiry as last agreed with the store
    expires_at: OffsetDateTime,
    /// Monotonic deadline used for local validity checks
    deadline: Instant,
}

impl Lease {
    pub fn new(
        key: impl Into<String>,
        lock_key: impl Into<String>,
        token: impl Into<String>,
        lease_timeout: Duration,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let lease_timeout = lease_timeout.min(MAX_DURATION);
        Self {
            key: key.into(),
            lock_key: lock_key.into(),
            token: token.into(),
            acquired_at: now,
            expires_at: now + lease_timeout,
            deadline: deadline_after(lease_timeout),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> OffsetDateTime {
        self.acquired_at
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Local estimate; the store may have expired the key slightly earlier.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Record a successful extension: the store now expires the key `ttl` from now.
    pub(crate) fn renew(&mut self, ttl: Duration) {
        let ttl = ttl.min(MAX_DURATION);
        self.expires_at = OffsetDateTime::now_utc() + ttl;
        self.deadline = deadline_after(ttl);
    }
}
