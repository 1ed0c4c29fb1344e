//! Redis-backed [`CacheStore`] for multi-node deployments.

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::dependency_unavailable(format!("redis client: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::dependency_unavailable(format!("redis connect: {e}")))?;
        Ok(Self { conn })
    }

    fn bus_error(e: redis::RedisError) -> Error {
        Error::dependency_unavailable(format!("redis: {e}"))
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(Self::bus_error)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(Self::bus_error),
            None => conn.set(key, value).await.map_err(Self::bus_error),
        }
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::bus_error)?;
        Ok(outcome.is_some())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(Self::bus_error)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(Self::bus_error)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd(set, member).await.map_err(Self::bus_error)
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem(set, member).await.map_err(Self::bus_error)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(set).await.map_err(Self::bus_error)
    }

    async fn list_push(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value)
            .await
            .map_err(Self::bus_error)?;
        if let Some(ttl) = ttl {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(Self::bus_error)?;
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let stop = limit.saturating_sub(1) as isize;
        conn.lrange(key, 0, stop).await.map_err(Self::bus_error)
    }
}
