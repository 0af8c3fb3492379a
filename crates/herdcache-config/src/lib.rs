//! Configuration for the herdcache engine.
//!
//! Every section deserializes with field-level defaults, so an empty file (or
//! no file at all) yields a usable single-instance configuration. Values can be
//! layered from a TOML file and `HERDCACHE__SECTION__FIELD` environment
//! variables via [`loader::load_config`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Remote key-value store connection
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache tiers and TTL defaults
    #[serde(default)]
    pub cache: CacheConfig,
    /// Lease acquisition timing
    #[serde(default)]
    pub lock: LockConfig,
    /// Payload encoding
    #[serde(default)]
    pub serializer: SerializerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Cache validations
        if self.cache.namespace.trim().is_empty() {
            return Err("cache.namespace must not be empty".into());
        }
        if self.cache.default_ttl_secs == 0 {
            return Err("cache.default_ttl_secs must be > 0".into());
        }
        if self.cache.local_max_entries == 0 {
            return Err("cache.local_max_entries must be > 0".into());
        }
        // Lock validations
        if self.lock.prefix.is_empty() {
            return Err("lock.prefix must not be empty".into());
        }
        if self.lock.lease_timeout_ms == 0 || self.lock.acquire_timeout_ms == 0 {
            return Err("lock timeouts must be > 0".into());
        }
        if self.lock.max_poll_interval_ms == 0 {
            return Err("lock.max_poll_interval_ms must be > 0".into());
        }
        // Lease keys and cached values must never share a key space
        if self.lock.prefix.starts_with(&self.cache.namespace)
            || self.cache.namespace.starts_with(&self.lock.prefix)
        {
            return Err(format!(
                "lock.prefix '{}' overlaps cache.namespace '{}'",
                self.lock.prefix, self.cache.namespace
            ));
        }
        // Redis validation
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.enabled=true requires redis.url".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
        }
        // Serializer validation
        if self.serializer.compression_level > 9 {
            return Err("serializer.compression_level must be within 0..=9".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades to an in-process store without it)
    /// Default: false
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Cache tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prefix applied to every cached value key (`<namespace>:<key>`)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// System default TTL, also used to correct non-positive per-call TTLs
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Use the in-process tier unless a call says otherwise
    #[serde(default = "default_true")]
    pub local_enabled: bool,

    /// Use the remote tier unless a call says otherwise
    #[serde(default = "default_true")]
    pub remote_enabled: bool,

    /// Local (L1) cache max entries
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// Swallow cache-layer errors and walk the fallback ladder instead
    #[serde(default = "default_true")]
    pub hide_errors: bool,
}

fn default_namespace() -> String {
    "cache".to_string()
}

fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_true() -> bool {
    true
}

fn default_local_max_entries() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            default_ttl_secs: default_ttl_secs(),
            local_enabled: true,
            remote_enabled: true,
            local_max_entries: default_local_max_entries(),
            hide_errors: true,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Lease acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Protect `get_or_set` misses with a distributed lease
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Reserved key prefix for leases; must not overlap `cache.namespace`
    #[serde(default = "default_lock_prefix")]
    pub prefix: String,

    /// How long a lease lives in the store before auto-expiring
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// How long a caller polls for a contended lease
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Upper bound on the sleep between acquisition attempts
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Run the factory unprotected when the lease cannot be obtained
    #[serde(default = "default_true")]
    pub fallback_to_factory: bool,
}

fn default_lock_prefix() -> String {
    "lock:".to_string()
}

fn default_lease_timeout_ms() -> u64 {
    10_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_max_poll_interval_ms() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_lock_prefix(),
            lease_timeout_ms: default_lease_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            fallback_to_factory: true,
        }
    }
}

impl LockConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }
}

/// Payload encoding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializerConfig {
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    /// Payloads larger than this are gzip-compressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    /// gzip level, 0..=9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_compression_level() -> u32 {
    6
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold_bytes: default_compression_threshold(),
            compression_level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "herdcache.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                } else {
                    tracing::warn!(path = %p, "config file not found, using defaults");
                }
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., HERDCACHE__REDIS__ENABLED=true
        builder = builder.add_source(
            Environment::with_prefix("HERDCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Render a configuration as TOML, e.g. to seed a config file.
    pub fn render_toml(cfg: &AppConfig) -> Result<String, String> {
        toml::to_string_pretty(cfg).map_err(|e| format!("config render error: {e}"))
    }
}
