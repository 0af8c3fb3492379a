//! Redis-backed remote store.
//!
//! Lease release and extension run as Lua scripts so the token comparison and
//! the mutation happen in one server-side step. Acquisition uses the native
//! `SET key token NX PX ms` form, which is already atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use herdcache_config::RedisConfig;
use redis::AsyncCommands;

use super::{RemoteStore, ttl_millis};
use crate::error::{CacheError, Result};

/// Delete the lease key only while it still carries the caller's token.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Re-arm the lease TTL only while it still carries the caller's token.
const EXTEND_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Remote store over a `deadpool-redis` connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    release_script: redis::Script,
    extend_script: redis::Script,
}

impl RedisStore {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            release_script: redis::Script::new(RELEASE_SCRIPT),
            extend_script: redis::Script::new(EXTEND_SCRIPT),
        }
    }

    /// Create a pool from configuration. Does not open a connection yet.
    pub fn from_config(config: &RedisConfig) -> Result<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = config.pool_size;
            pool_config.timeouts.wait = Some(config.timeout());
            pool_config.timeouts.create = Some(config.timeout());
            pool_config.timeouts.recycle = Some(config.timeout());
        } else {
            let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
            pool_config.timeouts.wait = Some(config.timeout());
            pool_config.timeouts.create = Some(config.timeout());
            pool_config.timeouts.recycle = Some(config.timeout());
            redis_config.pool = Some(pool_config);
        }

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Config(format!("failed to create Redis pool: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

fn signed_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX)
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn mode(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let data = conn.get::<_, Option<Vec<u8>>>(key).await?;
        Ok(data)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed = conn.del::<_, i64>(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall::<_, HashMap<String, String>>(key).await?)
    }

    async fn hash_replace(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        if fields.is_empty() {
            conn.del::<_, ()>(key).await?;
            return Ok(());
        }

        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        // MULTI/EXEC so readers never observe a half-written hash
        redis::pipe()
            .atomic()
            .del(key)
            .ignore()
            .hset_multiple(key, &items[..])
            .ignore()
            .pexpire(key, signed_millis(ttl))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = self
            .extend_script
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
