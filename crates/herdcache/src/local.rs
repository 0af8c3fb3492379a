//! In-process (L1) tier.
//!
//! Per-instance and never synchronized with other processes: it is a soft,
//! possibly stale copy of the remote tier that is repopulated on the next miss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::metrics;

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so hits hand out the payload without copying.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.cached_at.elapsed())
    }
}

/// Bounded `DashMap` cache with per-entry TTL.
#[derive(Clone)]
pub struct LocalCache {
    entries: Arc<DashMap<String, CachedEntry>>,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Get a live entry's payload; expired entries are removed on the way.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(Arc::clone(&entry.data));
            }
            // Remove expired entry
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        None
    }

    /// Insert or overwrite `key`.
    ///
    /// Past the size bound, expired entries are purged first; if that is not
    /// enough an arbitrary entry is evicted.
    pub fn insert(&self, key: &str, data: Vec<u8>, ttl: Duration) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.entries.retain(|_, e| !e.is_expired());
            while self.entries.len() >= self.max_entries {
                let Some(victim) = self.entries.iter().next().map(|e| e.key().clone()) else {
                    break;
                };
                self.entries.remove(&victim);
                tracing::debug!(key = %victim, "evicted local entry");
            }
        }
        self.entries
            .insert(key.to_string(), CachedEntry::new(data, ttl));
        metrics::set_local_entries(self.entries.len());
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        metrics::set_local_entries(self.entries.len());
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remaining TTL of a live entry.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.remaining())
    }

    pub fn clear(&self) {
        self.entries.clear();
        metrics::set_local_entries(0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
