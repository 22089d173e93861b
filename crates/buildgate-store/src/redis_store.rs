//! Redis-backed key-value store.

use async_trait::async_trait;
use buildgate_core::{KeyValueStore, Result};
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue};
use std::time::Duration;

use crate::{StoreError, StoreResult};

/// [`KeyValueStore`] over a shared Redis server.
///
/// The connection manager reconnects on its own; each call clones the
/// handle, so the store can be shared freely between workers.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        let value = cmd.query_async(&mut conn).await.map_err(StoreError::from)?;
        Ok(value)
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX rejects zero; a sub-millisecond ttl still has to expire.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.query(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let changed: i64 = if ttl.is_zero() {
            self.query(redis::cmd("EXPIRE").arg(key).arg(0)).await?
        } else {
            self.query(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
                .await?
        };
        Ok(changed > 0)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.query(redis::cmd("MGET").arg(keys)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.query(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl)),
        )
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: redis::Value = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(!matches!(reply, redis::Value::Nil))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("LPOP").arg(key)).await
    }

    async fn lindex(&self, key: &str, index: isize) -> Result<Option<String>> {
        self.query(redis::cmd("LINDEX").arg(key).arg(index)).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize> {
        self.query(redis::cmd("LREM").arg(key).arg(count).arg(value))
            .await
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self
            .query(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(removed > 0)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        self.query(redis::cmd("HKEYS").arg(key)).await
    }
}
