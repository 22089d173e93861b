//! Key-value store capability shared by every worker.
//!
//! Each call is a single atomic operation on one key. Nothing here groups
//! calls into transactions, so multi-step sequences built on top of this
//! trait must tolerate interleaving with other workers.
//!
//! Lists follow Redis semantics: a list that becomes empty stops existing,
//! and reading a missing list yields an empty result.

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set a time-to-live. A zero duration removes the key right away.
    /// Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Set `key` to `value` with a time-to-live in one step.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.set(key, value).await?;
        self.expire(key, ttl).await?;
        Ok(())
    }

    /// Set `key` only if it does not exist, with a time-to-live, in one
    /// step. Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Append to a list, returning its new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<usize>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn lindex(&self, key: &str, index: isize) -> Result<Option<String>>;

    /// Inclusive range; negative indices count from the end.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Remove occurrences of `value`: `count > 0` from the head, `count < 0`
    /// from the tail, `0` all of them. Returns how many were removed.
    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize>;

    async fn llen(&self, key: &str) -> Result<usize>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Returns whether the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>>;
}
