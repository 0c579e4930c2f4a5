//! Redis-backed set cache.
//!
//! Writes run `SADD` and `PEXPIRE` inside one `MULTI` block so a key is never
//! left without a TTL.

use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use tracing::instrument;

use super::{CacheError, CacheKey, SetCache};

#[derive(Clone)]
pub struct RedisSetCache {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisSetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSetCache").finish_non_exhaustive()
    }
}

impl RedisSetCache {
    /// Connect to `redis_url` (e.g. "redis://localhost:6379").
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis_error)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SetCache for RedisSetCache {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn members(&self, key: &CacheKey) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.smembers(key.to_string()).await.map_err(map_redis_error)
    }

    #[instrument(skip(self, members), fields(key = %key, members = members.len()), err)]
    async fn add_members(
        &self,
        key: &CacheKey,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        let key = key.to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);

        let mut conn = self.conn.clone();
        ::redis::pipe()
            .atomic()
            .sadd(&key, members)
            .ignore()
            .pexpire(&key, ttl_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key.to_string())
            .await
            .map_err(map_redis_error)
    }
}

fn map_redis_error(err: ::redis::RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}
