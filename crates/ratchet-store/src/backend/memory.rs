//! In-memory [`StateStore`] backend.
//!
//! Backs unit and integration tests and single-node development. TTL
//! handling is lazy: expired entries are dropped when touched by a read,
//! write, or scan.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    /// Sorted collections: member -> score. Ordering is computed on read.
    zsets: HashMap<String, HashMap<String, f64>>,
}

/// In-memory store with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift every TTL backwards by `delta`, so entries expire as if that
    /// much wall-clock time had passed. Lets tests exercise expiry without
    /// sleeping.
    pub fn advance(&self, delta: Duration) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        for entry in inner.kv.values_mut() {
            if let Some(at) = entry.expires_at {
                entry.expires_at = Some(at.checked_sub(delta).unwrap_or_else(Instant::now));
            }
        }
    }

    fn purge_if_expired(inner: &mut Inner, key: &str) {
        let now = Instant::now();
        if inner.kv.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.kv.remove(key);
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Self::purge_if_expired(&mut inner, key);
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.kv.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Self::purge_if_expired(&mut inner, key);
        Ok(inner.kv.remove(key).is_some())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Self::purge_if_expired(&mut inner, key);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Self::purge_if_expired(&mut inner, key);
        let current = match inner.kv.get(key) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::Unavailable(format!("{key} is not an integer")))?,
            None => 0,
        };
        let next = current + 1;
        let expires_at = inner.kv.get(key).and_then(|e| e.expires_at);
        inner.kv.insert(
            key.to_owned(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Self::purge_if_expired(&mut inner, key);
        match inner.kv.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .zsets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, &f64)> = zset.iter().collect();
        members.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));

        let len = members.len() as isize;
        let resolve = |rank: isize| -> isize {
            if rank < 0 { (len + rank).max(0) } else { rank }
        };
        let start = resolve(start);
        let stop = resolve(stop).min(len - 1);
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(members[start as usize..=stop as usize]
            .iter()
            .map(|(m, _)| (*m).clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .zsets
            .get_mut(key)
            .is_some_and(|z| z.remove(member).is_some()))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|_, score| *score < min || *score > max);
        Ok((before - zset.len()) as u64)
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Instant::now();
        inner.kv.retain(|_, e| !e.is_expired(now));

        // Deterministic pagination: sorted keys, cursor = position.
        let mut keys: Vec<&String> = inner
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();

        let start = cursor as usize;
        if start >= keys.len() {
            return Ok((0, Vec::new()));
        }
        let end = (start + count).min(keys.len());
        let page = keys[start..end].iter().map(|k| (*k).clone()).collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_del_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.put("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_if_absent_is_atomic_per_key() {
        let store = MemoryStore::new();
        assert!(
            store
                .set_if_absent("lock", "a", Duration::from_secs(60))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_if_absent("lock", "b", Duration::from_secs(60))
                .await
                .unwrap()
        );
        assert_eq!(store.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn ttl_expiry_via_advance() {
        let store = MemoryStore::new();
        store
            .put("k", "v", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        store.advance(Duration::from_secs(31));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_set_if_absent_can_be_retaken() {
        let store = MemoryStore::new();
        assert!(
            store
                .set_if_absent("lock", "a", Duration::from_secs(10))
                .await
                .unwrap()
        );
        store.advance(Duration::from_secs(11));
        assert!(
            store
                .set_if_absent("lock", "b", Duration::from_secs(10))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn expire_resets_the_ttl() {
        let store = MemoryStore::new();
        store.put("k", "v", None).await.unwrap();

        assert!(store.expire("k", Duration::from_secs(30)).await.unwrap());
        store.advance(Duration::from_secs(31));
        assert_eq!(store.get("k").await.unwrap(), None);

        // Expiring a missing key reports false.
        assert!(!store.expire("ghost", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn incr_starts_at_one_and_counts_up() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("seq:test").await.unwrap(), 1);
        assert_eq!(store.incr("seq:test").await.unwrap(), 2);
        assert_eq!(store.incr("seq:test").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn zset_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("idx", "c", 3.0).await.unwrap();
        store.zadd("idx", "a", 1.0).await.unwrap();
        store.zadd("idx", "b", 2.0).await.unwrap();

        let all = store.zrange("idx", 0, -1).await.unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);

        let first_two = store.zrange("idx", 0, 1).await.unwrap();
        assert_eq!(first_two, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn zrem_and_zremrangebyscore() {
        let store = MemoryStore::new();
        store.zadd("idx", "a", 1.0).await.unwrap();
        store.zadd("idx", "b", 2.0).await.unwrap();
        store.zadd("idx", "c", 3.0).await.unwrap();

        assert!(store.zrem("idx", "b").await.unwrap());
        assert!(!store.zrem("idx", "b").await.unwrap());

        let removed = store.zremrangebyscore("idx", 0.0, 1.5).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.zrange("idx", 0, -1).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn scan_pages_through_prefix() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .put(&format!("task:{i:02}"), "x", None)
                .await
                .unwrap();
        }
        store.put("other:1", "x", None).await.unwrap();

        let (cursor, page1) = store.scan("task:", 0, 2).await.unwrap();
        assert_eq!(page1, vec!["task:00", "task:01"]);
        assert_ne!(cursor, 0);

        let (cursor, page2) = store.scan("task:", cursor, 2).await.unwrap();
        assert_eq!(page2, vec!["task:02", "task:03"]);

        let (cursor, page3) = store.scan("task:", cursor, 2).await.unwrap();
        assert_eq!(page3, vec!["task:04"]);
        assert_eq!(cursor, 0);
    }
}
