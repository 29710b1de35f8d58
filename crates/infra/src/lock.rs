//! Entity-scoped distributed locks with heartbeat renewal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::keys::KeySpace;
use crate::kv::{KvError, KvStore};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} acquiring {lock_key}")]
    Timeout { lock_key: String, waited: Duration },
    #[error(transparent)]
    Store(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Upper bound on time spent retrying the acquire.
    pub timeout: Duration,
    pub retry_delay: Duration,
    /// Renewal period; `None` renews every `ttl / 2`.
    pub heartbeat: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(100),
            heartbeat: None,
        }
    }
}

impl LockOptions {
    fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
            .unwrap_or(self.ttl / 2)
            .max(Duration::from_millis(1))
    }
}

/// Result of an acquire attempt. `handle` is `None` when the lock stayed busy
/// for the whole timeout.
#[derive(Debug)]
pub struct LockAttempt {
    pub lock_key: String,
    pub handle: Option<LockHandle>,
}

impl LockAttempt {
    pub fn acquired(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    defaults: LockOptions,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        Self {
            kv,
            keys,
            defaults: LockOptions::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: LockOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> LockOptions {
        self.defaults
    }

    /// Try to take the lock for `entity_type:entity_id`, polling until `timeout`.
    #[instrument(skip(self, options))]
    pub async fn acquire(
        &self,
        entity_type: &str,
        entity_id: &str,
        options: LockOptions,
    ) -> Result<LockAttempt, KvError> {
        let lock_key = self.keys.lock(entity_type, entity_id);
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + options.timeout;

        loop {
            if self.kv.set_nx(&lock_key, &token, Some(options.ttl)).await? {
                debug!(lock_key = %lock_key, "lock acquired");
                let handle = LockHandle::start(self.kv.clone(), lock_key.clone(), token, options);
                return Ok(LockAttempt {
                    lock_key,
                    handle: Some(handle),
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(lock_key = %lock_key, "lock busy, giving up");
                return Ok(LockAttempt {
                    lock_key,
                    handle: None,
                });
            }
            tokio::time::sleep(options.retry_delay.min(deadline - now)).await;
        }
    }

    /// Run `f` while holding the entity lock. The lock is released on every exit path.
    pub async fn with_lock<T, F, Fut>(
        &self,
        entity_type: &str,
        entity_id: &str,
        options: LockOptions,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let attempt = self.acquire(entity_type, entity_id, options).await?;
        let Some(handle) = attempt.handle else {
            return Err(LockError::Timeout {
                lock_key: attempt.lock_key,
                waited: options.timeout,
            });
        };

        // A panic inside `f` drops `handle`, whose Drop still releases the key.
        let out = f().await;

        if let Err(err) = handle.release().await {
            warn!(error = %err, "lock release failed; key will expire by ttl");
        }
        Ok(out)
    }

    /// True if any holder currently owns the entity lock.
    pub async fn is_locked(&self, entity_type: &str, entity_id: &str) -> Result<bool, KvError> {
        Ok(self.kv.get(&self.keys.lock(entity_type, entity_id)).await?.is_some())
    }
}

/// A held lock. Dropping it stops the heartbeat and releases the key in the background.
pub struct LockHandle {
    kv: Arc<dyn KvStore>,
    lock_key: String,
    token: String,
    ttl: Duration,
    heartbeat: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    released: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_key", &self.lock_key)
            .field("ttl", &self.ttl)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    fn start(kv: Arc<dyn KvStore>, lock_key: String, token: String, options: LockOptions) -> Self {
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            kv.clone(),
            lock_key.clone(),
            token.clone(),
            options.ttl,
            options.heartbeat_interval(),
            cancel.clone(),
        ));
        Self {
            kv,
            lock_key,
            token,
            ttl: options.ttl,
            heartbeat: Some(heartbeat),
            cancel,
            released: false,
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Reset the TTL now. Returns `false` if the lock is no longer ours.
    pub async fn extend(&self, ttl: Duration) -> Result<bool, KvError> {
        self.kv.expire_if_equals(&self.lock_key, &self.token, ttl).await
    }

    /// Stop the heartbeat and delete the key if we still hold it.
    pub async fn release(mut self) -> Result<bool, KvError> {
        self.released = true;
        self.cancel.cancel();
        if let Some(hb) = self.heartbeat.take() {
            let _ = hb.await;
        }
        let removed = self.kv.compare_and_delete(&self.lock_key, &self.token).await?;
        debug!(lock_key = %self.lock_key, removed, "lock released");
        Ok(removed)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cancel.cancel();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let kv = self.kv.clone();
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(err) = kv.compare_and_delete(&lock_key, &token).await {
                warn!(lock_key = %lock_key, error = %err, "background lock release failed");
            }
        });
    }
}

async fn heartbeat_loop(
    kv: Arc<dyn KvStore>,
    lock_key: String,
    token: String,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match kv.expire_if_equals(&lock_key, &token, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(lock_key = %lock_key, "lock lost before heartbeat; stopping renewal");
                return;
            }
            Err(err) => warn!(lock_key = %lock_key, error = %err, "lock heartbeat failed"),
        }
    }
}
