//! Redis-backed key-value store (feature `redis`).
//!
//! Conditional writes run as Lua scripts so each check-and-mutate is a single
//! atomic round trip, safe across any number of worker processes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::instrument;

use super::{KvError, KvResult, KvStore};

const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if cur then return 0 end
elseif cur ~= ARGV[2] then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

const COMPARE_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_EXPIRE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const INCR_TTL_SCRIPT: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

struct Scripts {
    cas: Script,
    compare_delete: Script,
    compare_expire: Script,
    incr_ttl: Script,
}

/// Redis key-value store over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

fn backend(err: redis::RedisError) -> KvError {
    KvError::Backend(err.to_string())
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn redis_limit(limit: Option<usize>) -> isize {
    limit.map(|n| n as isize).unwrap_or(-1)
}

impl RedisKvStore {
    /// Connect to `redis_url`.
    pub async fn connect(redis_url: impl AsRef<str>) -> KvResult<Self> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self::from_manager(conn))
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: Arc::new(Scripts {
                cas: Script::new(CAS_SCRIPT),
                compare_delete: Script::new(COMPARE_DELETE_SCRIPT),
                compare_expire: Script::new(COMPARE_EXPIRE_SCRIPT),
                incr_ttl: Script::new(INCR_TTL_SCRIPT),
            }),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.conn().get(key).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        cmd.query_async::<_, ()>(&mut self.conn()).await.map_err(backend)
    }

    #[instrument(skip(self, value), level = "trace")]
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut self.conn()).await.map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        let applied: i64 = self
            .scripts
            .cas
            .key(key)
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl.map(ttl_ms).unwrap_or(0))
            .invoke_async(&mut self.conn())
            .await
            .map_err(backend)?;
        Ok(applied == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        let removed: i64 = self
            .scripts
            .compare_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool> {
        let applied: i64 = self
            .scripts
            .compare_expire
            .key(key)
            .arg(expected)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut self.conn())
            .await
            .map_err(backend)?;
        Ok(applied == 1)
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let removed: i64 = self.conn().del(key).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        self.scripts
            .incr_ttl
            .key(key)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut self.conn())
            .await
            .map_err(backend)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        self.conn()
            .zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(backend)
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let removed: i64 = self.conn().zrem(key, member).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        self.conn()
            .zrangebyscore_limit_withscores(key, min, max, offset as isize, redis_limit(limit))
            .await
            .map_err(backend)
    }

    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        limit: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        self.conn()
            .zrevrangebyscore_limit_withscores(key, max, min, offset as isize, redis_limit(limit))
            .await
            .map_err(backend)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.conn().zcount(key, min, max).await.map_err(backend)
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        self.conn().zcard(key).await.map_err(backend)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.conn().zrembyscore(key, min, max).await.map_err(backend)
    }

    async fn sadd(&self, key: &str, member: &str) -> KvResult<bool> {
        let added: i64 = self.conn().sadd(key, member).await.map_err(backend)?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> KvResult<bool> {
        let removed: i64 = self.conn().srem(key, member).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        self.conn().smembers(key).await.map_err(backend)
    }
}
