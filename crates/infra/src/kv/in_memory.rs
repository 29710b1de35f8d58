//! In-memory key-value store for tests/dev and single-process deployments.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{KvError, KvResult, KvStore};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl Inner {
    /// Live value for `key`, evicting it if expired.
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.strings.get(key).is_some_and(|e| !e.live(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn sorted(&self, key: &str, min: f64, max: f64) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, s)| **s >= min && **s <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

fn expiry(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|t| now + t)
}

fn page(items: Vec<(String, f64)>, offset: usize, limit: Option<usize>) -> Vec<(String, f64)> {
    let iter = items.into_iter().skip(offset);
    match limit {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

/// TTL-aware in-memory store.
///
/// Expiry follows `tokio::time`, so tests can drive it with a paused clock.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    inner: Mutex<Inner>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> KvResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| KvError::Poisoned)
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut inner = self.lock()?;
        Ok(inner.live_value(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let now = Instant::now();
        self.lock()?.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        if inner.live_value(key, now).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let current = inner.live_value(key, now).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let matches = inner.live_value(key, now).is_some_and(|e| e.value == expected);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        match inner.live_value(key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let existed = inner.live_value(key, now).is_some();
        inner.strings.remove(key);
        let zset = inner.zsets.remove(key).is_some();
        let set = inner.sets.remove(key).is_some();
        Ok(existed || zset || set)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        match inner.live_value(key, now) {
            Some(entry) => {
                let next = entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| KvError::NotAnInteger { key: key.to_string() })?
                    + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                inner.strings.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        self.lock()?
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut inner = self.lock()?;
        let removed = inner
            .zsets
            .get_mut(key)
            .is_some_and(|z| z.remove(member).is_some());
        if inner.zsets.get(key).is_some_and(|z| z.is_empty()) {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        let inner = self.lock()?;
        Ok(page(inner.sorted(key, min, max), offset, limit))
    }

    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        limit: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        let inner = self.lock()?;
        let mut members = inner.sorted(key, min, max);
        members.reverse();
        Ok(page(members, offset, limit))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        let inner = self.lock()?;
        Ok(inner
            .zsets
            .get(key)
            .map(|z| z.values().filter(|s| **s >= min && **s <= max).count() as u64)
            .unwrap_or(0))
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        let inner = self.lock()?;
        Ok(inner.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        let mut inner = self.lock()?;
        let Some(z) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = z.len();
        z.retain(|_, s| *s < min || *s > max);
        Ok((before - z.len()) as u64)
    }

    async fn sadd(&self, key: &str, member: &str) -> KvResult<bool> {
        Ok(self
            .lock()?
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner.sets.get_mut(key).is_some_and(|s| s.remove(member)))
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_writes_absent_keys() {
        let kv = InMemoryKvStore::new();
        assert!(kv.set_nx("a", "1", None).await.unwrap());
        assert!(!kv.set_nx("a", "2", None).await.unwrap());
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_keys() {
        let kv = InMemoryKvStore::new();
        kv.set("a", "1", Some(Duration::from_secs(5))).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(kv.get("a").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(kv.get("a").await.unwrap().is_none());
        assert!(kv.set_nx("a", "2", None).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_checks_current_value() {
        let kv = InMemoryKvStore::new();
        assert!(kv.compare_and_swap("k", None, "v1", None).await.unwrap());
        assert!(!kv.compare_and_swap("k", None, "v2", None).await.unwrap());
        assert!(!kv.compare_and_swap("k", Some("other"), "v2", None).await.unwrap());
        assert!(kv.compare_and_swap("k", Some("v1"), "v2", None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let kv = InMemoryKvStore::new();
        kv.set("lock", "token-a", None).await.unwrap();
        assert!(!kv.compare_and_delete("lock", "token-b").await.unwrap());
        assert!(kv.compare_and_delete("lock", "token-a").await.unwrap());
        assert!(kv.get("lock").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn incr_with_ttl_sets_expiry_on_first_increment_only() {
        let kv = InMemoryKvStore::new();
        let ttl = Duration::from_secs(10);
        assert_eq!(kv.incr_with_ttl("c", ttl).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.incr_with_ttl("c", ttl).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(kv.incr_with_ttl("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sorted_set_ranges_and_trimming() {
        let kv = InMemoryKvStore::new();
        kv.zadd("z", 3.0, "c").await.unwrap();
        kv.zadd("z", 1.0, "a").await.unwrap();
        kv.zadd("z", 2.0, "b").await.unwrap();

        let asc = kv.zrange_by_score("z", 0.0, 10.0, 0, None).await.unwrap();
        assert_eq!(asc.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>(), ["a", "b", "c"]);

        let desc = kv.zrevrange_by_score("z", 10.0, 0.0, 1, Some(1)).await.unwrap();
        assert_eq!(desc[0].0, "b");

        assert_eq!(kv.zcount("z", 2.0, 3.0).await.unwrap(), 2);
        assert_eq!(kv.zrem_range_by_score("z", 0.0, 1.5).await.unwrap(), 1);
        assert_eq!(kv.zcard("z").await.unwrap(), 2);
        assert!(kv.zrem("z", "b").await.unwrap());
        assert!(!kv.zrem("z", "b").await.unwrap());
    }

    #[tokio::test]
    async fn sets_track_membership() {
        let kv = InMemoryKvStore::new();
        assert!(kv.sadd("s", "x").await.unwrap());
        assert!(!kv.sadd("s", "x").await.unwrap());
        kv.sadd("s", "y").await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), ["x", "y"]);
        assert!(kv.srem("s", "x").await.unwrap());
        assert_eq!(kv.smembers("s").await.unwrap(), ["y"]);
    }
}
