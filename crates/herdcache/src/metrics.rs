//! Cache and lease metrics.
//!
//! Emitted through the `metrics` facade; installing a recorder/exporter is
//! left to the embedding application. Without one these calls are no-ops.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "herdcache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "herdcache_misses_total";
    pub const LOCAL_ENTRIES: &str = "herdcache_local_entries";
    pub const FACTORY_RUNS_TOTAL: &str = "herdcache_factory_runs_total";
    pub const FALLBACKS_TOTAL: &str = "herdcache_fallbacks_total";

    // Lease metrics
    pub const LEASE_ACQUIRED_TOTAL: &str = "herdcache_lock_acquired_total";
    pub const LEASE_RELEASED_TOTAL: &str = "herdcache_lock_released_total";
    pub const LEASE_TIMEOUTS_TOTAL: &str = "herdcache_lock_timeouts_total";
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit for the given tier ("local" or "remote").
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss across all enabled tiers.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn set_local_entries(count: usize) {
    gauge!(names::LOCAL_ENTRIES).set(count as f64);
}

pub fn record_factory_run() {
    counter!(names::FACTORY_RUNS_TOTAL).increment(1);
}

/// Record a fallback activation, labelled by where the value came from.
pub fn record_fallback(source: &'static str) {
    counter!(names::FALLBACKS_TOTAL, "source" => source).increment(1);
}

// =============================================================================
// Lease Metrics
// =============================================================================

pub fn record_lease_acquired() {
    counter!(names::LEASE_ACQUIRED_TOTAL).increment(1);
}

pub fn record_lease_released() {
    counter!(names::LEASE_RELEASED_TOTAL).increment(1);
}

pub fn record_lease_timeout() {
    counter!(names::LEASE_TIMEOUTS_TOTAL).increment(1);
}
