//! In-process key-value store with Redis semantics.
//!
//! Used by tests and single-process deployments. Expiry is lazy: an expired
//! key is dropped the next time anything touches it.

use async_trait::async_trait;
use buildgate_core::{KeyValueStore, Result};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_empty_collection(&self) -> bool {
        match &self.value {
            Value::Str(_) => false,
            Value::List(list) => list.is_empty(),
            Value::Hash(hash) => hash.is_empty(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
}

impl Inner {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, key: &str) -> std::result::Result<Option<&String>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list(&mut self, key: &str) -> std::result::Result<Option<&mut VecDeque<String>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash(
        &mut self,
        key: &str,
    ) -> std::result::Result<Option<&mut HashMap<String, String>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(Some(hash)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Empty lists and hashes stop existing, as in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_empty_collection) {
            self.entries.remove(key);
        }
    }
}

/// Resolve a possibly negative list index against `len`.
/// Expiry instant for `ttl` from now. A ttl too large to represent never
/// expires.
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

fn resolve_index(index: isize, len: usize) -> Option<usize> {
    let len = len as isize;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

/// A [`KeyValueStore`] held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently exists.
    pub async fn exists(&self, key: &str) -> bool {
        self.inner.lock().await.live(key).is_some()
    }

    /// Remaining time-to-live of `key`, if it exists and has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        let expires_at = inner.live(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.string(key)?.cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .entries
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string())));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if ttl.is_zero() {
            let existed = inner.live(key).is_some();
            inner.entries.remove(key);
            return Ok(existed);
        }
        match inner.live(key) {
            Some(entry) => {
                entry.expires_at = deadline(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let existed = inner.live(key).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut inner = self.inner.lock().await;
        Ok(keys
            .iter()
            .map(|key| inner.string(key).ok().flatten().cloned())
            .collect())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires_at = deadline(ttl);
        inner.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live(key).is_some() {
            return Ok(false);
        }
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires_at = deadline(ttl);
        inner.entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.list(key)? {
            list.push_back(value.to_string());
            return Ok(list.len());
        }
        inner.entries.insert(
            key.to_string(),
            Entry::new(Value::List(VecDeque::from([value.to_string()]))),
        );
        Ok(1)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        let popped = inner.list(key)?.and_then(VecDeque::pop_front);
        inner.drop_if_empty(key);
        Ok(popped)
    }

    async fn lindex(&self, key: &str, index: isize) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.list(key)? else {
            return Ok(None);
        };
        Ok(resolve_index(index, list.len()).and_then(|i| list.get(i).cloned()))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.list(key)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.list(key)? else {
            return Ok(0);
        };
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs()
        };
        let mut removed = 0;
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        inner.drop_if_empty(key);
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        Ok(inner.list(key)?.map_or(0, |list| list.len()))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.hash(key)?.and_then(|hash| hash.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(hash) = inner.hash(key)? {
            hash.insert(field.to_string(), value.to_string());
            return Ok(());
        }
        let hash = HashMap::from([(field.to_string(), value.to_string())]);
        inner
            .entries
            .insert(key.to_string(), Entry::new(Value::Hash(hash)));
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let existed = inner
            .hash(key)?
            .is_some_and(|hash| hash.remove(field).is_some());
        inner.drop_if_empty(key);
        Ok(existed)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .hash(key)?
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_strings_and_expiry() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.ttl("a").await, None);

        assert!(store.expire("a", Duration::from_secs(60)).await.unwrap());
        assert!(store.ttl("a").await.is_some());

        assert!(store.expire("a", Duration::ZERO).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(!store.expire("a", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_is_gone() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("lock", "7", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("lock").await.unwrap(), None);
        assert!(
            store
                .set_if_absent("lock", "8", Duration::from_secs(1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let store = MemoryStore::new();
        store.set_with_ttl("a", "1", Duration::MAX).await.unwrap();
        assert!(store.set_if_absent("b", "2", Duration::MAX).await.unwrap());
        assert!(store.expire("b", Duration::MAX).await.unwrap());

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.ttl("b").await, None);
    }

    #[tokio::test]
    async fn test_set_if_absent_only_writes_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("k", "1", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "2", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_mget_returns_none_for_missing_and_lists() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        store.rpush("l", "x").await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string(), "l".to_string()];
        assert_eq!(
            store.mget(&keys).await.unwrap(),
            vec![Some("1".to_string()), None, None]
        );
    }

    #[tokio::test]
    async fn test_list_operations() {
        let store = MemoryStore::new();
        for v in ["4", "5", "4", "6"] {
            store.rpush("q", v).await.unwrap();
        }
        assert_eq!(store.llen("q").await.unwrap(), 4);
        assert_eq!(store.lindex("q", 0).await.unwrap().as_deref(), Some("4"));
        assert_eq!(store.lindex("q", -1).await.unwrap().as_deref(), Some("6"));
        assert_eq!(store.lindex("q", 9).await.unwrap(), None);
        assert_eq!(store.lrange("q", 1, 2).await.unwrap(), vec!["5", "4"]);
        assert_eq!(
            store.lrange("q", 0, -1).await.unwrap(),
            vec!["4", "5", "4", "6"]
        );
        assert!(store.lrange("q", 3, 1).await.unwrap().is_empty());

        assert_eq!(store.lrem("q", -1, "4").await.unwrap(), 1);
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["4", "5", "6"]);
        assert_eq!(store.lrem("q", 0, "4").await.unwrap(), 1);
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_empty_list_stops_existing() {
        let store = MemoryStore::new();
        store.rpush("q", "1").await.unwrap();
        assert_eq!(store.lrem("q", 0, "1").await.unwrap(), 1);
        assert!(!store.exists("q").await);
        assert_eq!(store.llen("q").await.unwrap(), 0);
        assert!(store.lrange("q", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();
        store.hset("h", "1", "a").await.unwrap();
        store.hset("h", "2", "b").await.unwrap();
        let mut keys = store.hkeys("h").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["1", "2"]);
        assert_eq!(store.hget("h", "2").await.unwrap().as_deref(), Some("b"));
        assert!(store.hdel("h", "1").await.unwrap());
        assert!(!store.hdel("h", "1").await.unwrap());
        assert!(store.hdel("h", "2").await.unwrap());
        assert!(!store.exists("h").await);
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("s", "1").await.unwrap();
        assert!(store.rpush("s", "x").await.is_err());
        assert!(store.hget("s", "f").await.is_err());
        store.rpush("l", "x").await.unwrap();
        assert!(store.get("l").await.is_err());
    }
}
