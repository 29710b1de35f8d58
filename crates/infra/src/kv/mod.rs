//! Shared key-value store used for all cross-process coordination.
//!
//! Every piece of state that several worker processes race on (idempotency
//! records, circuit state, locks, quarantine and SLA sets) lives behind this
//! trait and is mutated only through its atomic primitives.
//!
//! - Strings carry an optional TTL
//! - Sorted sets are ordered by `f64` score (timestamps in ms)
//! - Sets are unordered membership lists

use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKvStore;

/// Key-value backend failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    #[error("kv store lock poisoned")]
    Poisoned,
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("kv value for {key} is not an integer")]
    NotAnInteger { key: String },
}

pub type KvResult<T> = Result<T, KvError>;

/// Atomic key-value operations.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Unconditional write. `None` ttl persists the key.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool>;

    /// Replace the value if it currently equals `expected` (`None` = key absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> KvResult<bool>;

    /// Delete the key only if it holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool>;

    /// Reset the TTL only if the key holds `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool>;

    async fn del(&self, key: &str) -> KvResult<bool>;

    /// Increment a counter; the TTL is applied when the counter is created.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> KvResult<i64>;

    /// Insert or re-score a sorted-set member.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>>;

    /// Members with `min <= score <= max`, descending by score.
    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        limit: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>>;

    async fn zcount(&self, key: &str, min: f64, max: f64) -> KvResult<u64>;

    async fn zcard(&self, key: &str) -> KvResult<u64>;

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<u64>;

    async fn sadd(&self, key: &str, member: &str) -> KvResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> KvResult<bool>;

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;
}
