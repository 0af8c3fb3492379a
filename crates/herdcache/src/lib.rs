//! Distributed cache-aside engine with lease-based stampede protection.
//!
//! Two tiers (a per-process `DashMap` and a shared Redis store) sit in front of
//! a caller-supplied factory. On a miss, a lease in the shared store makes sure
//! only one caller across all processes runs the factory while the others wait
//! and read its result.

pub mod cache;
pub mod error;
pub mod fallback;
pub mod lease;
pub mod local;
pub mod lock;
pub mod metrics;
pub mod observability;
pub mod options;
pub mod serializer;
pub mod store;

pub use cache::{CACHE_TIMESTAMP_FIELD, CacheStats, CacheValue, DistributedCache, HashFields};
pub use error::{CacheError, Result};
pub use fallback::FallbackValue;
pub use herdcache_config::{
    AppConfig, CacheConfig, LockConfig, LoggingConfig, RedisConfig, SerializerConfig,
};
pub use lease::{Lease, generate_token};
pub use local::{CachedEntry, LocalCache};
pub use lock::{LeaseHandle, LockProvider, is_held_by_current_task};
pub use observability::{apply_logging_level, init_tracing};
pub use options::CacheOptions;
pub use serializer::Serializer;
pub use store::{DynStore, MemoryStore, RedisStore, RemoteStore, connect};
