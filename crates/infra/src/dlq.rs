//! Dead-letter storage: one entry per terminally failed job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use jobforge_core::{DlqEntry, JobId};

use crate::keys::KeySpace;
use crate::kv::{KvError, KvStore};

/// How long the single-write marker outlives the entry's creation.
const WRITTEN_MARKER_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error(transparent)]
    Store(#[from] KvError),
    #[error("corrupt dlq entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        Self { kv, keys }
    }

    /// Store `entry` unless this job was already dead-lettered.
    /// Returns `false` for the duplicate write.
    pub async fn add(&self, entry: &DlqEntry) -> Result<bool, DlqError> {
        let marker = self.keys.dlq_written(entry.original_job_id);
        if !self
            .kv
            .set_nx(&marker, &Utc::now().to_rfc3339(), Some(WRITTEN_MARKER_TTL))
            .await?
        {
            debug!(job_id = %entry.original_job_id, "dlq entry already written");
            return Ok(false);
        }

        self.write(entry).await?;
        info!(
            job_id = %entry.original_job_id,
            job_type = %entry.job_type,
            attempts = entry.attempts_made,
            "job dead-lettered"
        );
        Ok(true)
    }

    /// Operator write that ignores the single-write marker, for jobs whose
    /// earlier entry was deleted or replayed.
    pub async fn restore(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        self.kv
            .set(
                &self.keys.dlq_written(entry.original_job_id),
                &Utc::now().to_rfc3339(),
                Some(WRITTEN_MARKER_TTL),
            )
            .await?;
        self.write(entry).await?;
        info!(job_id = %entry.original_job_id, job_type = %entry.job_type, "dlq entry restored");
        Ok(())
    }

    async fn write(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        let key = self.keys.dlq_entry(&entry.job_type, entry.original_job_id);
        let encoded = serde_json::to_string(entry).map_err(|e| DlqError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.kv.set(&key, &encoded, None).await?;
        self.kv
            .zadd(
                &self.keys.dlq(&entry.job_type),
                entry.failed_at.timestamp_millis() as f64,
                &entry.original_job_id.to_string(),
            )
            .await?;
        self.kv.sadd(&self.keys.dlq_types(), &entry.job_type).await?;
        Ok(())
    }

    pub async fn get(&self, job_type: &str, job_id: JobId) -> Result<Option<DlqEntry>, DlqError> {
        let key = self.keys.dlq_entry(job_type, job_id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| DlqError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Newest first.
    pub async fn list(
        &self,
        job_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DlqEntry>, DlqError> {
        let members = self
            .kv
            .zrevrange_by_score(
                &self.keys.dlq(job_type),
                f64::INFINITY,
                f64::NEG_INFINITY,
                offset,
                Some(limit),
            )
            .await?;

        let mut entries = Vec::with_capacity(members.len());
        for (member, _) in members {
            let Ok(job_id) = member.parse::<JobId>() else {
                continue;
            };
            if let Some(entry) = self.get(job_type, job_id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn remove(&self, job_type: &str, job_id: JobId) -> Result<bool, DlqError> {
        let existed = self.kv.del(&self.keys.dlq_entry(job_type, job_id)).await?;
        self.kv.zrem(&self.keys.dlq(job_type), &job_id.to_string()).await?;
        Ok(existed)
    }

    pub async fn count(&self, job_type: &str) -> Result<u64, DlqError> {
        Ok(self.kv.zcard(&self.keys.dlq(job_type)).await?)
    }

    pub async fn job_types(&self) -> Result<Vec<String>, DlqError> {
        Ok(self.kv.smembers(&self.keys.dlq_types()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use jobforge_core::{EntityRef, JobEnvelope, JobError, JobRecord};

    fn dlq() -> DeadLetterQueue {
        DeadLetterQueue::new(Arc::new(InMemoryKvStore::new()), KeySpace::new("test"))
    }

    fn entry(job_type: &str) -> DlqEntry {
        let env = JobEnvelope::new(job_type, "k", EntityRef::new("user", 1_i64));
        let mut record = JobRecord::new(env, format!("test:queue:{job_type}"), 5);
        record.attempts = 5;
        DlqEntry::new(&record, &JobError::new("Error", "ECONNRESET"))
    }

    #[tokio::test]
    async fn entry_is_written_once() {
        let dlq = dlq();
        let e = entry("email.send");
        let (a, b) = tokio::join!(dlq.add(&e), dlq.add(&e));
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(dlq.count("email.send").await.unwrap(), 1);
        assert_eq!(dlq.get("email.send", e.original_job_id).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        let dlq = dlq();
        let mut older = entry("ai.content");
        older.failed_at = older.failed_at - chrono::Duration::seconds(10);
        let newer = entry("ai.content");
        dlq.add(&older).await.unwrap();
        dlq.add(&newer).await.unwrap();

        let listed = dlq.list("ai.content", 0, 10).await.unwrap();
        assert_eq!(listed[0].original_job_id, newer.original_job_id);
        assert_eq!(listed[1].original_job_id, older.original_job_id);

        let page = dlq.list("ai.content", 1, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(dlq.job_types().await.unwrap(), ["ai.content"]);
    }

    #[tokio::test]
    async fn removed_entry_is_not_rewritten() {
        let dlq = dlq();
        let e = entry("email.send");
        dlq.add(&e).await.unwrap();
        assert!(dlq.remove("email.send", e.original_job_id).await.unwrap());
        assert_eq!(dlq.count("email.send").await.unwrap(), 0);
        assert!(!dlq.add(&e).await.unwrap());
    }

    #[tokio::test]
    async fn restore_rewrites_a_removed_entry() {
        let dlq = dlq();
        let e = entry("email.send");
        dlq.add(&e).await.unwrap();
        dlq.remove("email.send", e.original_job_id).await.unwrap();

        dlq.restore(&e).await.unwrap();
        assert_eq!(dlq.get("email.send", e.original_job_id).await.unwrap(), Some(e.clone()));
        assert_eq!(dlq.count("email.send").await.unwrap(), 1);
        assert!(!dlq.add(&e).await.unwrap());
    }
}
