//! Quarantine lane: holds jobs whose failures look anomalous for manual triage.
//!
//! Evaluated after a job has exhausted retries or failed non-retryably. The
//! rules run in order and the first match wins:
//!
//! 1. `REPEATED_FAILURE`: same error signature ≥ 3 times for the job type in 5 min
//! 2. `SUSPICIOUS_PAYLOAD`: serialized payload larger than 10 MB
//! 3. `POISON_PILL`: the error classifies as poison
//! 4. `RATE_ABUSE`: ≥ 10 failures for the same entity (type and id) in 5 min
//!
//! Stored payloads are sanitized: secret-looking keys are dropped and large
//! payloads are reduced to a preview.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use jobforge_core::{
    ActorId, DlqEntry, ErrorClass, ErrorClassifier, ErrorSnapshot, JobEnvelope, JobError, JobId,
    JobRecord,
};
use jobforge_events::QueueEvents;

use crate::dlq::{DeadLetterQueue, DlqError};
use crate::keys::KeySpace;
use crate::kv::{KvError, KvStore};

pub const SIGNATURE_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const REPEATED_FAILURE_THRESHOLD: i64 = 3;
pub const RATE_ABUSE_THRESHOLD: i64 = 10;
pub const SUSPICIOUS_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;
/// Sanitized payloads larger than this are replaced by a preview.
pub const STORED_PAYLOAD_LIMIT: usize = 64 * 1024;
pub const PREVIEW_BYTES: usize = 500;

const MESSAGE_PREFIX_CHARS: usize = 100;
const STACK_PREFIX_CHARS: usize = 200;

const SECRET_KEY_MARKERS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "apikey",
    "api_key",
    "secret",
    "authorization",
    "credential",
    "privatekey",
    "private_key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuarantineReason {
    RepeatedFailure,
    SuspiciousPayload,
    SignatureMismatch,
    RateAbuse,
    PoisonPill,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::RepeatedFailure => "REPEATED_FAILURE",
            QuarantineReason::SuspiciousPayload => "SUSPICIOUS_PAYLOAD",
            QuarantineReason::SignatureMismatch => "SIGNATURE_MISMATCH",
            QuarantineReason::RateAbuse => "RATE_ABUSE",
            QuarantineReason::PoisonPill => "POISON_PILL",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    #[error(transparent)]
    Store(#[from] KvError),
    #[error(transparent)]
    Dlq(#[from] DlqError),
    #[error("corrupt quarantine entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("quarantined job {job_id} of type {job_type} not found")]
    NotFound { job_type: String, job_id: JobId },
    #[error("original payload for quarantined job {job_id} is not recoverable")]
    PayloadUnavailable { job_id: JobId },
}

/// A failed job being considered for quarantine.
#[derive(Debug, Clone, Copy)]
pub struct QuarantineCandidate<'a> {
    pub job_type: &'a str,
    pub job_id: JobId,
    pub attempts: u32,
    pub error: &'a JobError,
    pub payload: &'a JobEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantineDecision {
    pub quarantine: bool,
    pub reason: Option<QuarantineReason>,
}

impl QuarantineDecision {
    fn hold(reason: QuarantineReason) -> Self {
        Self {
            quarantine: true,
            reason: Some(reason),
        }
    }

    fn pass() -> Self {
        Self {
            quarantine: false,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedJob {
    pub job_type: String,
    pub job_id: JobId,
    pub reason: QuarantineReason,
    pub error_name: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    /// Sanitized; never contains secret-looking keys.
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineStats {
    pub total: u64,
    pub by_job_type: BTreeMap<String, u64>,
    pub by_reason: BTreeMap<QuarantineReason, u64>,
}

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    let compact: String = lower.chars().filter(|c| *c != '-').collect();
    SECRET_KEY_MARKERS
        .iter()
        .any(|marker| lower.contains(marker) || compact.contains(marker))
}

fn strip_secrets(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .filter(|(k, _)| !is_secret_key(k))
                .map(|(k, v)| (k.clone(), strip_secrets(v)))
                .collect::<Map<_, _>>(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(strip_secrets).collect()),
        other => other.clone(),
    }
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Drop secret-looking keys at any depth and shrink oversized payloads to a preview.
pub fn sanitize_payload(payload: &JsonValue) -> JsonValue {
    let clean = strip_secrets(payload);
    let encoded = clean.to_string();
    if encoded.len() <= STORED_PAYLOAD_LIMIT {
        return clean;
    }
    json!({
        "_truncated": true,
        "originalSize": encoded.len(),
        "preview": truncate_bytes(&encoded, PREVIEW_BYTES),
    })
}

/// Stable hash of `(name, message prefix, stack prefix)`.
pub fn error_signature(error: &JobError) -> String {
    let message: String = error.message.chars().take(MESSAGE_PREFIX_CHARS).collect();
    let stack: String = error
        .stack
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(STACK_PREFIX_CHARS)
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(error.name.as_bytes());
    hasher.update(b"|");
    hasher.update(message.as_bytes());
    hasher.update(b"|");
    hasher.update(stack.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub struct QuarantineLane {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    events: Arc<QueueEvents>,
    classifier: Arc<ErrorClassifier>,
}

impl std::fmt::Debug for QuarantineLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuarantineLane")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl QuarantineLane {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace, events: Arc<QueueEvents>) -> Self {
        Self {
            kv,
            keys,
            events,
            classifier: Arc::new(ErrorClassifier::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Count this failure and decide whether the job belongs in quarantine.
    pub async fn should_quarantine(
        &self,
        candidate: &QuarantineCandidate<'_>,
    ) -> Result<QuarantineDecision, QuarantineError> {
        let signature = error_signature(candidate.error);
        let sig_count = self
            .kv
            .incr_with_ttl(
                &self.keys.quarantine_signature(candidate.job_type, &signature),
                SIGNATURE_WINDOW,
            )
            .await?;

        let entity_count = self
            .kv
            .incr_with_ttl(
                &self.keys.quarantine_entity(&candidate.payload.entity.key()),
                SIGNATURE_WINDOW,
            )
            .await?;

        if sig_count >= REPEATED_FAILURE_THRESHOLD {
            return Ok(QuarantineDecision::hold(QuarantineReason::RepeatedFailure));
        }

        let payload_size = serde_json::to_vec(candidate.payload)
            .map(|v| v.len())
            .unwrap_or(0);
        if payload_size > SUSPICIOUS_PAYLOAD_BYTES {
            return Ok(QuarantineDecision::hold(QuarantineReason::SuspiciousPayload));
        }

        if self.classifier.classify(candidate.error).class == ErrorClass::Poison {
            return Ok(QuarantineDecision::hold(QuarantineReason::PoisonPill));
        }

        if entity_count >= RATE_ABUSE_THRESHOLD {
            return Ok(QuarantineDecision::hold(QuarantineReason::RateAbuse));
        }

        Ok(QuarantineDecision::pass())
    }

    /// Store a sanitized quarantine record and announce it.
    pub async fn add_job(
        &self,
        candidate: &QuarantineCandidate<'_>,
        reason: QuarantineReason,
    ) -> Result<QuarantinedJob, QuarantineError> {
        let raw_payload = serde_json::to_value(candidate.payload).unwrap_or(JsonValue::Null);
        let job = QuarantinedJob {
            job_type: candidate.job_type.to_string(),
            job_id: candidate.job_id,
            reason,
            error_name: candidate.error.name.clone(),
            error_message: candidate.error.message.clone(),
            failed_at: Utc::now(),
            attempts: candidate.attempts,
            payload: sanitize_payload(&raw_payload),
        };

        let key = self.keys.quarantine_entry(&job.job_type, job.job_id);
        let encoded = serde_json::to_string(&job).map_err(|e| QuarantineError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.kv.set(&key, &encoded, None).await?;
        self.kv
            .zadd(
                &self.keys.quarantine(&job.job_type),
                job.failed_at.timestamp_millis() as f64,
                &job.job_id.to_string(),
            )
            .await?;
        self.kv.sadd(&self.keys.quarantine_types(), &job.job_type).await?;

        warn!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            reason = reason.as_str(),
            "job quarantined"
        );
        self.events
            .job_quarantined(&job.job_type, job.job_id, reason.as_str(), &job.error_message);
        Ok(job)
    }

    pub async fn get_job(
        &self,
        job_type: &str,
        job_id: JobId,
    ) -> Result<Option<QuarantinedJob>, QuarantineError> {
        let key = self.keys.quarantine_entry(job_type, job_id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QuarantineError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Newest first.
    pub async fn list_jobs(
        &self,
        job_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<QuarantinedJob>, QuarantineError> {
        let members = self
            .kv
            .zrevrange_by_score(
                &self.keys.quarantine(job_type),
                f64::INFINITY,
                f64::NEG_INFINITY,
                offset,
                Some(limit),
            )
            .await?;
        let mut jobs = Vec::with_capacity(members.len());
        for (member, _) in members {
            let Ok(job_id) = member.parse::<JobId>() else {
                continue;
            };
            if let Some(job) = self.get_job(job_type, job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn delete_entry(&self, job_type: &str, job_id: JobId) -> Result<bool, QuarantineError> {
        let existed = self.kv.del(&self.keys.quarantine_entry(job_type, job_id)).await?;
        self.kv
            .zrem(&self.keys.quarantine(job_type), &job_id.to_string())
            .await?;
        Ok(existed)
    }

    /// Release a job from quarantine without further action.
    pub async fn remove_job(
        &self,
        job_type: &str,
        job_id: JobId,
        actor_id: Option<ActorId>,
    ) -> Result<bool, QuarantineError> {
        let removed = self.delete_entry(job_type, job_id).await?;
        if removed {
            info!(job_id = %job_id, job_type = %job_type, "quarantined job released");
            self.events.quarantine_released(job_type, job_id, actor_id);
        }
        Ok(removed)
    }

    /// Move a quarantined job into the DLQ so it can be replayed.
    ///
    /// The full envelope is taken from `record` when available; otherwise the
    /// sanitized payload must still parse as an envelope.
    pub async fn promote_to_dlq(
        &self,
        job_type: &str,
        job_id: JobId,
        record: Option<&JobRecord>,
        dlq: &DeadLetterQueue,
        actor_id: Option<ActorId>,
    ) -> Result<DlqEntry, QuarantineError> {
        let job = self
            .get_job(job_type, job_id)
            .await?
            .ok_or_else(|| QuarantineError::NotFound {
                job_type: job_type.to_string(),
                job_id,
            })?;

        let payload = match record {
            Some(record) => record.payload.clone(),
            None => serde_json::from_value::<JobEnvelope>(job.payload.clone())
                .map_err(|_| QuarantineError::PayloadUnavailable { job_id })?,
        };

        let entry = DlqEntry {
            original_job_id: job_id,
            original_queue: record
                .map(|r| r.queue_name.clone())
                .unwrap_or_else(|| self.keys.queue(job_type)),
            job_type: job_type.to_string(),
            attempts_made: job.attempts,
            failed_at: job.failed_at,
            error: ErrorSnapshot {
                name: job.error_name.clone(),
                message: job.error_message.clone(),
                code: None,
                stack: None,
            },
            payload,
        };
        if !dlq.add(&entry).await? {
            if dlq.get(job_type, job_id).await?.is_some() {
                info!(job_id = %job_id, "job already present in dlq; dropping quarantine copy");
            } else {
                dlq.restore(&entry).await?;
            }
        }

        self.delete_entry(job_type, job_id).await?;
        self.events.quarantine_promoted(job_type, job_id, actor_id);
        Ok(entry)
    }

    /// Drop every quarantined job of `job_type`. Returns how many were removed.
    pub async fn clear_quarantine(
        &self,
        job_type: &str,
        actor_id: Option<ActorId>,
    ) -> Result<u64, QuarantineError> {
        let set_key = self.keys.quarantine(job_type);
        let members = self
            .kv
            .zrange_by_score(&set_key, f64::NEG_INFINITY, f64::INFINITY, 0, None)
            .await?;
        for (member, _) in &members {
            if let Ok(job_id) = member.parse::<JobId>() {
                self.kv.del(&self.keys.quarantine_entry(job_type, job_id)).await?;
            }
        }
        self.kv.del(&set_key).await?;
        self.kv.srem(&self.keys.quarantine_types(), job_type).await?;

        let removed = members.len() as u64;
        info!(job_type = %job_type, removed, "quarantine cleared");
        self.events.quarantine_cleared(job_type, removed, actor_id);
        Ok(removed)
    }

    pub async fn count(&self, job_type: &str) -> Result<u64, QuarantineError> {
        Ok(self.kv.zcard(&self.keys.quarantine(job_type)).await?)
    }

    pub async fn get_stats(&self) -> Result<QuarantineStats, QuarantineError> {
        let mut stats = QuarantineStats::default();
        for job_type in self.kv.smembers(&self.keys.quarantine_types()).await? {
            let jobs = self.list_jobs(&job_type, 0, usize::MAX).await?;
            if jobs.is_empty() {
                continue;
            }
            stats.total += jobs.len() as u64;
            stats.by_job_type.insert(job_type, jobs.len() as u64);
            for job in jobs {
                *stats.by_reason.entry(job.reason).or_default() += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use jobforge_core::EntityRef;
    use jobforge_events::{InMemoryEventBus, QueueEventType};
    use proptest::prelude::*;

    struct Fixture {
        lane: QuarantineLane,
        dlq: DeadLetterQueue,
        events: Arc<QueueEvents>,
    }

    fn fixture() -> Fixture {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let keys = KeySpace::new("test");
        let events = Arc::new(QueueEvents::new(Arc::new(InMemoryEventBus::new())));
        Fixture {
            lane: QuarantineLane::new(kv.clone(), keys.clone(), events.clone()),
            dlq: DeadLetterQueue::new(kv, keys),
            events,
        }
    }

    fn envelope(entity_id: i64) -> JobEnvelope {
        JobEnvelope::new("plugin.hook", "k", EntityRef::new("plugin", entity_id))
            .with_meta("apiKey", json!("sk-live"))
            .with_meta("hook", json!("afterSave"))
    }

    fn candidate<'a>(error: &'a JobError, payload: &'a JobEnvelope) -> QuarantineCandidate<'a> {
        QuarantineCandidate {
            job_type: "plugin.hook",
            job_id: JobId::new(),
            attempts: 5,
            error,
            payload,
        }
    }

    #[tokio::test]
    async fn repeated_signature_triggers_on_third_occurrence() {
        let f = fixture();
        let error = JobError::new("Error", "ECONNRESET while calling hook");
        let payload = envelope(1);

        let first = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        let second = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        let third = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();

        assert!(!first.quarantine);
        assert!(!second.quarantine);
        assert_eq!(third.reason, Some(QuarantineReason::RepeatedFailure));
    }

    #[tokio::test]
    async fn poison_errors_are_quarantined_immediately() {
        let f = fixture();
        let error = JobError::new("SyntaxError", "Unexpected token < in JSON");
        let payload = envelope(2);
        let decision = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        assert_eq!(decision.reason, Some(QuarantineReason::PoisonPill));
    }

    #[tokio::test]
    async fn many_failures_for_one_entity_is_rate_abuse() {
        let f = fixture();
        let payload = envelope(77);
        let mut last = QuarantineDecision::pass();
        for i in 0..10 {
            let error = JobError::new("Error", format!("upstream 503 #{i}"));
            last = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        }
        assert_eq!(last.reason, Some(QuarantineReason::RateAbuse));
    }

    #[tokio::test]
    async fn oversized_payload_is_suspicious() {
        let f = fixture();
        let error = JobError::new("Error", "hook returned 500");
        let payload = envelope(4).with_meta("blob", json!("x".repeat(SUSPICIOUS_PAYLOAD_BYTES + 1)));
        let decision = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        assert_eq!(decision.reason, Some(QuarantineReason::SuspiciousPayload));

        let small = envelope(5);
        let decision = f.lane.should_quarantine(&candidate(&error, &small)).await.unwrap();
        assert!(!decision.quarantine);
    }

    #[tokio::test]
    async fn repeated_failure_wins_over_later_rules() {
        let f = fixture();
        let error = JobError::new("SyntaxError", "Unexpected token < in JSON");
        let payload = envelope(6).with_meta("blob", json!("x".repeat(SUSPICIOUS_PAYLOAD_BYTES + 1)));

        let first = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        let second = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        let third = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();

        assert_eq!(first.reason, Some(QuarantineReason::SuspiciousPayload));
        assert_eq!(second.reason, Some(QuarantineReason::SuspiciousPayload));
        assert_eq!(third.reason, Some(QuarantineReason::RepeatedFailure));
    }

    #[tokio::test]
    async fn poison_wins_over_rate_abuse() {
        let f = fixture();
        let payload = envelope(8);
        for i in 0..9 {
            let error = JobError::new("Error", format!("upstream 503 #{i}"));
            f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        }
        let error = JobError::new("SyntaxError", "Unexpected token < in JSON");
        let decision = f.lane.should_quarantine(&candidate(&error, &payload)).await.unwrap();
        assert_eq!(decision.reason, Some(QuarantineReason::PoisonPill));
    }

    #[tokio::test]
    async fn entity_failures_are_counted_per_entity_type() {
        let f = fixture();
        let user = JobEnvelope::new("plugin.hook", "k", EntityRef::new("user", 42_i64));
        let post = JobEnvelope::new("plugin.hook", "k", EntityRef::new("post", 42_i64));
        let mut last = QuarantineDecision::pass();
        for i in 0..10 {
            let error = JobError::new("Error", format!("upstream 503 #{i}"));
            let payload = if i % 2 == 0 { &user } else { &post };
            last = f.lane.should_quarantine(&candidate(&error, payload)).await.unwrap();
        }
        assert!(!last.quarantine);
    }

    #[tokio::test]
    async fn add_job_sanitizes_and_emits() {
        let f = fixture();
        let error = JobError::new("Error", "bad hook");
        let payload = envelope(3);
        let c = candidate(&error, &payload);

        let stored = f.lane.add_job(&c, QuarantineReason::PoisonPill).await.unwrap();
        assert!(stored.payload["meta"].get("apiKey").is_none());
        assert_eq!(stored.payload["meta"]["hook"], json!("afterSave"));

        assert_eq!(f.lane.get_job("plugin.hook", c.job_id).await.unwrap(), Some(stored));
        assert_eq!(f.lane.count("plugin.hook").await.unwrap(), 1);
        let kinds: Vec<_> = f.events.recent(None, 10).into_iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, [QueueEventType::JobQuarantined]);
    }

    #[tokio::test]
    async fn promote_moves_entry_into_dlq() {
        let f = fixture();
        let error = JobError::new("Error", "bad hook");
        let payload = envelope(4);
        let c = candidate(&error, &payload);
        f.lane.add_job(&c, QuarantineReason::RepeatedFailure).await.unwrap();

        let entry = f
            .lane
            .promote_to_dlq("plugin.hook", c.job_id, None, &f.dlq, Some(ActorId::new(9)))
            .await
            .unwrap();
        assert_eq!(entry.original_queue, "test:queue:plugin.hook");
        assert_eq!(entry.payload.meta.get("hook"), Some(&json!("afterSave")));
        assert!(f.lane.get_job("plugin.hook", c.job_id).await.unwrap().is_none());
        assert_eq!(f.dlq.count("plugin.hook").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn promote_restores_an_entry_deleted_from_the_dlq() {
        let f = fixture();
        let error = JobError::new("Error", "bad hook");
        let payload = envelope(6);
        let c = candidate(&error, &payload);
        let mut record = JobRecord::new(payload.clone(), "test:queue:plugin.hook", 5);
        record.id = c.job_id;
        f.dlq.add(&DlqEntry::new(&record, &error)).await.unwrap();
        f.lane.add_job(&c, QuarantineReason::RepeatedFailure).await.unwrap();
        assert!(f.dlq.remove("plugin.hook", c.job_id).await.unwrap());

        let entry = f
            .lane
            .promote_to_dlq("plugin.hook", c.job_id, Some(&record), &f.dlq, None)
            .await
            .unwrap();
        assert_eq!(f.dlq.get("plugin.hook", c.job_id).await.unwrap(), Some(entry));
        assert_eq!(f.dlq.count("plugin.hook").await.unwrap(), 1);
        assert_eq!(f.lane.count("plugin.hook").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promote_keeps_an_existing_dlq_entry() {
        let f = fixture();
        let error = JobError::new("Error", "bad hook");
        let payload = envelope(7);
        let c = candidate(&error, &payload);
        let mut record = JobRecord::new(payload.clone(), "test:queue:plugin.hook", 5);
        record.id = c.job_id;
        let original = DlqEntry::new(&record, &error);
        f.dlq.add(&original).await.unwrap();
        f.lane.add_job(&c, QuarantineReason::RepeatedFailure).await.unwrap();

        f.lane
            .promote_to_dlq("plugin.hook", c.job_id, Some(&record), &f.dlq, None)
            .await
            .unwrap();
        assert_eq!(f.dlq.get("plugin.hook", c.job_id).await.unwrap(), Some(original));
        assert_eq!(f.dlq.count("plugin.hook").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn promote_missing_job_is_not_found() {
        let f = fixture();
        let err = f
            .lane
            .promote_to_dlq("plugin.hook", JobId::new(), None, &f.dlq, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QuarantineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn remove_clear_and_stats() {
        let f = fixture();
        let error = JobError::new("Error", "x");
        let payload = envelope(5);
        let a = candidate(&error, &payload);
        let b = candidate(&error, &payload);
        f.lane.add_job(&a, QuarantineReason::PoisonPill).await.unwrap();
        f.lane.add_job(&b, QuarantineReason::RateAbuse).await.unwrap();

        let stats = f.lane.get_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_reason[&QuarantineReason::RateAbuse], 1);

        assert!(f.lane.remove_job("plugin.hook", a.job_id, None).await.unwrap());
        assert!(!f.lane.remove_job("plugin.hook", a.job_id, None).await.unwrap());
        assert_eq!(f.lane.clear_quarantine("plugin.hook", None).await.unwrap(), 1);
        assert_eq!(f.lane.get_stats().await.unwrap(), QuarantineStats::default());
    }

    #[test]
    fn oversized_payload_becomes_preview() {
        let big = json!({ "body": "x".repeat(STORED_PAYLOAD_LIMIT + 1), "token": "t" });
        let clean = sanitize_payload(&big);
        assert_eq!(clean["_truncated"], json!(true));
        assert!(clean["preview"].as_str().unwrap().len() <= PREVIEW_BYTES);
        assert!(!clean["preview"].as_str().unwrap().contains("token"));
    }

    #[test]
    fn signature_ignores_message_tail() {
        let base = "m".repeat(MESSAGE_PREFIX_CHARS);
        let a = JobError::new("Error", format!("{base}-tail-a"));
        let b = JobError::new("Error", format!("{base}-tail-b"));
        let c = JobError::new("TypeError", format!("{base}-tail-a"));
        assert_eq!(error_signature(&a), error_signature(&b));
        assert_ne!(error_signature(&a), error_signature(&c));
    }

    fn contains_secret_key(value: &JsonValue) -> bool {
        match value {
            JsonValue::Object(map) => map
                .iter()
                .any(|(k, v)| is_secret_key(k) || contains_secret_key(v)),
            JsonValue::Array(items) => items.iter().any(contains_secret_key),
            _ => false,
        }
    }

    fn arb_json() -> impl Strategy<Value = JsonValue> {
        let key = prop_oneof![
            "[a-z]{1,8}",
            Just("password".to_string()),
            Just("X-Api-Key".to_string()),
            Just("accessToken".to_string()),
            Just("client_secret".to_string()),
            Just("Authorization".to_string()),
        ];
        let leaf = prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z ]{0,12}".prop_map(JsonValue::String),
        ];
        leaf.prop_recursive(3, 32, 6, move |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::Array),
                prop::collection::btree_map(key.clone(), inner, 0..6)
                    .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn sanitizer_never_leaks_secret_keys(value in arb_json()) {
            let clean = sanitize_payload(&value);
            prop_assert!(!contains_secret_key(&clean));
        }
    }
}
