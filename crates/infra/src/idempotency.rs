//! Idempotent admission and burst dedupe.
//!
//! `check_or_create` maps one idempotency key to at most one job. The first
//! caller reserves the key with an atomic set-if-absent; concurrent callers
//! wait for the reservation to resolve and then observe the winner's job id.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use jobforge_core::{JobId, JobStatus};

use crate::keys::KeySpace;
use crate::kv::{KvError, KvStore};

/// Default lifetime of an idempotency record.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const RESERVATION_POLL: Duration = Duration::from_millis(25);
const RESERVATION_WAIT: Duration = Duration::from_secs(5);
/// Lifetime of an unresolved reservation. An admission that dies between
/// reserving and committing frees its key once this lapses.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(60);
const UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError<E = Infallible> {
    #[error(transparent)]
    Store(#[from] KvError),
    #[error("corrupt idempotency record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
    /// Another admission holds the key and did not finish in time.
    #[error("idempotency key {key} is held by a concurrent admission")]
    Conflict { key: String },
    #[error("job creation failed: {0}")]
    Create(E),
}

/// Stored state for one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    /// `None` while the first admission is still creating the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    fn reservation(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            job_id: None,
            status: JobStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdempotencyOptions {
    /// Re-admit a key whose job reached a terminal state.
    pub allow_replay: bool,
    pub ttl: Duration,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            allow_replay: false,
            ttl: DEFAULT_IDEMPOTENCY_TTL,
        }
    }
}

/// Outcome of [`IdempotencyStore::check_or_create`].
#[derive(Debug, Clone, PartialEq)]
pub struct Admission<T> {
    pub job_id: JobId,
    pub is_new: bool,
    /// Whatever the create step returned; `None` on a hit.
    pub created: Option<T>,
}

#[derive(Clone)]
pub struct IdempotencyStore {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    reservation_wait: Duration,
    reservation_ttl: Duration,
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

fn encode(record: &IdempotencyRecord) -> String {
    // Only plain data fields; serialization cannot fail.
    serde_json::to_string(record).unwrap_or_default()
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        Self {
            kv,
            keys,
            reservation_wait: RESERVATION_WAIT,
            reservation_ttl: DEFAULT_RESERVATION_TTL,
        }
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn with_reservation_wait(mut self, wait: Duration) -> Self {
        self.reservation_wait = wait;
        self
    }

    fn decode<E>(&self, key: &str, raw: &str) -> Result<IdempotencyRecord, IdempotencyError<E>> {
        serde_json::from_str(raw).map_err(|e| IdempotencyError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let store_key = self.keys.idempotency(key);
        match self.kv.get(&store_key).await? {
            Some(raw) => self.decode::<Infallible>(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Return the job already admitted under `key`, or run `create` exactly once.
    ///
    /// - existing record (any state) → its job id, `is_new = false`
    /// - terminal record with `allow_replay` → `create` runs again
    /// - `create` failure releases the key so a later attempt can retry
    pub async fn check_or_create<T, E, F, Fut>(
        &self,
        key: &str,
        create: F,
        options: IdempotencyOptions,
    ) -> Result<Admission<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(JobId, T), E>>,
    {
        let store_key = self.keys.idempotency(key);
        let deadline = tokio::time::Instant::now() + self.reservation_wait;
        let lease = self.reservation_ttl.min(options.ttl);

        loop {
            let previous = match self.kv.get(&store_key).await? {
                None => {
                    let reservation = encode(&IdempotencyRecord::reservation(key));
                    if self.kv.set_nx(&store_key, &reservation, Some(lease)).await? {
                        return self.run_create(&store_key, key, reservation, None, create, options).await;
                    }
                    continue;
                }
                Some(raw) => raw,
            };

            let record = self.decode::<E>(key, &previous)?;
            match record.job_id {
                None => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(IdempotencyError::Conflict { key: key.to_string() });
                    }
                    tokio::time::sleep(RESERVATION_POLL).await;
                }
                Some(job_id) if record.status.is_terminal() && options.allow_replay => {
                    let reservation = encode(&IdempotencyRecord::reservation(key));
                    if self
                        .kv
                        .compare_and_swap(&store_key, Some(&previous), &reservation, Some(lease))
                        .await?
                    {
                        debug!(idempotency_key = %key, previous_job_id = %job_id, "replaying terminal idempotency record");
                        return self
                            .run_create(&store_key, key, reservation, Some(previous), create, options)
                            .await;
                    }
                }
                Some(job_id) => {
                    debug!(idempotency_key = %key, job_id = %job_id, status = %record.status, "idempotency hit");
                    return Ok(Admission {
                        job_id,
                        is_new: false,
                        created: None,
                    });
                }
            }
        }
    }

    async fn run_create<T, E, F, Fut>(
        &self,
        store_key: &str,
        key: &str,
        reservation: String,
        previous: Option<String>,
        create: F,
        options: IdempotencyOptions,
    ) -> Result<Admission<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(JobId, T), E>>,
    {
        match create().await {
            Ok((job_id, created)) => {
                let mut record = IdempotencyRecord::reservation(key);
                record.job_id = Some(job_id);
                self.kv.set(store_key, &encode(&record), Some(options.ttl)).await?;
                Ok(Admission {
                    job_id,
                    is_new: true,
                    created: Some(created),
                })
            }
            Err(err) => {
                let released = match &previous {
                    Some(prev) => {
                        self.kv
                            .compare_and_swap(store_key, Some(&reservation), prev, Some(options.ttl))
                            .await
                    }
                    None => self.kv.compare_and_delete(store_key, &reservation).await,
                };
                if let Err(kv_err) = released {
                    warn!(idempotency_key = %key, error = %kv_err, "failed to release idempotency reservation");
                }
                Err(IdempotencyError::Create(err))
            }
        }
    }

    /// Update the status stored under `key`. Returns `false` if no record exists.
    pub async fn update_status(
        &self,
        key: &str,
        status: JobStatus,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        let store_key = self.keys.idempotency(key);
        for _ in 0..UPDATE_ATTEMPTS {
            let Some(raw) = self.kv.get(&store_key).await? else {
                return Ok(false);
            };
            let mut record = self.decode::<Infallible>(key, &raw)?;
            record.status = status;
            record.updated_at = Utc::now();
            if self
                .kv
                .compare_and_swap(&store_key, Some(&raw), &encode(&record), Some(ttl))
                .await?
            {
                return Ok(true);
            }
        }
        Err(IdempotencyError::Conflict { key: key.to_string() })
    }

    /// Burst protection: `true` if this `(job_type, entity_key)` was not seen
    /// within `window`; records the sighting either way.
    pub async fn check_dedupe(
        &self,
        job_type: &str,
        entity_key: &str,
        window: Duration,
    ) -> Result<bool, KvError> {
        let key = self.keys.dedupe(job_type, entity_key);
        self.kv.set_nx(&key, &Utc::now().to_rfc3339(), Some(window)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::kv::InMemoryKvStore;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Arc::new(InMemoryKvStore::new()), KeySpace::new("test"))
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_reservation_expires_with_its_lease() {
        let store = store();
        let crashed = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .check_or_create(
                        "k",
                        || std::future::pending::<Result<(JobId, ()), Infallible>>(),
                        IdempotencyOptions::default(),
                    )
                    .await
            })
        };
        while store.get("k").await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }
        crashed.abort();

        let held = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), ())) }, IdempotencyOptions::default())
            .await;
        assert!(matches!(held, Err(IdempotencyError::Conflict { .. })));

        tokio::time::advance(Duration::from_secs(60 * 60)).await;

        let id = JobId::new();
        let admitted = store
            .check_or_create("k", || async move { Ok::<_, Infallible>((id, ())) }, IdempotencyOptions::default())
            .await
            .unwrap();
        assert!(admitted.is_new);
        assert_eq!(admitted.job_id, id);
        assert_eq!(store.get("k").await.unwrap().unwrap().job_id, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn committed_record_outlives_the_reservation_lease() {
        let store = store();
        let id = JobId::new();
        store
            .check_or_create("k", || async move { Ok::<_, Infallible>((id, ())) }, IdempotencyOptions::default())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert_eq!(store.get("k").await.unwrap().unwrap().job_id, Some(id));

        tokio::time::advance(DEFAULT_IDEMPOTENCY_TTL).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_admission_creates_and_second_hits() {
        let store = store();
        let id = JobId::new();

        let first = store
            .check_or_create("k", || async move { Ok::<_, Infallible>((id, "created")) }, Default::default())
            .await
            .unwrap();
        assert!(first.is_new);
        assert_eq!(first.created, Some("created"));

        let second = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), "again")) }, Default::default())
            .await
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.job_id, id);
        assert_eq!(second.created, None);
    }

    #[tokio::test]
    async fn concurrent_admissions_create_once() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));

        let admit = |calls: Arc<AtomicUsize>| {
            let store = store.clone();
            async move {
                store
                    .check_or_create(
                        "same",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, Infallible>((JobId::new(), ()))
                        },
                        Default::default(),
                    )
                    .await
                    .unwrap()
            }
        };

        let (a, b) = tokio::join!(admit(calls.clone()), admit(calls.clone()));
        assert_eq!(a.job_id, b.job_id);
        assert_ne!(a.is_new, b.is_new);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_record_requires_explicit_replay() {
        let store = store();
        let first = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), ())) }, Default::default())
            .await
            .unwrap();
        store
            .update_status("k", JobStatus::MovedToDlq, DEFAULT_IDEMPOTENCY_TTL)
            .await
            .unwrap();

        let hit = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), ())) }, Default::default())
            .await
            .unwrap();
        assert_eq!(hit.job_id, first.job_id);
        assert!(!hit.is_new);

        let replay = IdempotencyOptions {
            allow_replay: true,
            ..Default::default()
        };
        let replayed = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), ())) }, replay)
            .await
            .unwrap();
        assert!(replayed.is_new);
        assert_ne!(replayed.job_id, first.job_id);
        assert_eq!(store.get("k").await.unwrap().unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn replay_of_in_flight_job_returns_existing() {
        let store = store();
        let first = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), ())) }, Default::default())
            .await
            .unwrap();
        let replay = IdempotencyOptions {
            allow_replay: true,
            ..Default::default()
        };
        let again = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), ())) }, replay)
            .await
            .unwrap();
        assert_eq!(again.job_id, first.job_id);
        assert!(!again.is_new);
    }

    #[tokio::test]
    async fn failed_create_releases_key() {
        let store = store();
        let err = store
            .check_or_create("k", || async { Err::<(JobId, ()), _>("transport down") }, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Create("transport down")));
        assert!(store.get("k").await.unwrap().is_none());

        let retry = store
            .check_or_create("k", || async { Ok::<_, Infallible>((JobId::new(), ())) }, Default::default())
            .await
            .unwrap();
        assert!(retry.is_new);
    }

    #[tokio::test(start_paused = true)]
    async fn dedupe_window_rejects_until_expiry() {
        let store = store();
        let window = Duration::from_secs(10);
        assert!(store.check_dedupe("otp.send", "user:1", window).await.unwrap());
        assert!(!store.check_dedupe("otp.send", "user:1", window).await.unwrap());
        assert!(store.check_dedupe("otp.send", "user:2", window).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.check_dedupe("otp.send", "user:1", window).await.unwrap());
    }

    #[tokio::test]
    async fn update_status_on_missing_key_is_noop() {
        let store = store();
        assert!(!store
            .update_status("missing", JobStatus::Completed, DEFAULT_IDEMPOTENCY_TTL)
            .await
            .unwrap());
    }
}
