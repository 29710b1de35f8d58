//! Event emitter: stamps drafts and offers one helper per lifecycle transition.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::warn;

use jobforge_core::{ActorId, EventId, JobId, JobRecord};

use crate::bus::{EventBus, Subscription};
use crate::event::{EventDraft, QueueEvent, QueueEventType};
use crate::filter::{EventFilter, FilteredSubscription};

/// Events kept for timestamp polling when no capacity is configured.
pub const DEFAULT_RECENT_CAPACITY: usize = 1_000;

/// Publishes queue events on a single logical channel.
///
/// - assigns a UUIDv7 id and a strictly increasing timestamp to every event
/// - never fails: publication errors are logged and dropped
/// - keeps a bounded ring of recent events for "poll since timestamp" readers
pub struct QueueEvents {
    bus: Arc<dyn EventBus<QueueEvent>>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
    recent: Mutex<VecDeque<QueueEvent>>,
    recent_capacity: usize,
}

impl std::fmt::Debug for QueueEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEvents")
            .field("recent_capacity", &self.recent_capacity)
            .finish_non_exhaustive()
    }
}

impl QueueEvents {
    pub fn new(bus: Arc<dyn EventBus<QueueEvent>>) -> Self {
        Self {
            bus,
            last_timestamp: Mutex::new(None),
            recent: Mutex::new(VecDeque::with_capacity(DEFAULT_RECENT_CAPACITY)),
            recent_capacity: DEFAULT_RECENT_CAPACITY,
        }
    }

    pub fn with_recent_capacity(mut self, capacity: usize) -> Self {
        self.recent_capacity = capacity;
        self
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let ts = match *last {
            Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
            _ => now,
        };
        *last = Some(ts);
        ts
    }

    /// Stamp and broadcast a draft. Returns the event as published.
    pub fn publish(&self, draft: EventDraft) -> QueueEvent {
        let event = draft.stamp(EventId::new(), self.next_timestamp());

        if self.recent_capacity > 0 {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            if recent.len() >= self.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if let Err(err) = self.bus.publish(event.clone()) {
            warn!(
                event_type = ?event.event_type,
                event_id = %event.id,
                error = %err,
                "queue event publish failed"
            );
        }

        event
    }

    pub fn subscribe(&self) -> Subscription<QueueEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredSubscription {
        FilteredSubscription::new(self.bus.subscribe(), filter)
    }

    /// Events published by this emitter strictly after `since`, oldest first.
    pub fn recent(&self, since: Option<DateTime<Utc>>, limit: usize) -> Vec<QueueEvent> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent
            .iter()
            .filter(|e| since.is_none_or(|s| e.timestamp > s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn job_enqueued(&self, record: &JobRecord) -> QueueEvent {
        self.publish(
            EventDraft::for_job(QueueEventType::JobEnqueued, record)
                .meta("priority", json!(record.payload.priority.as_u8())),
        )
    }

    pub fn job_started(&self, record: &JobRecord) -> QueueEvent {
        self.publish(
            EventDraft::for_job(QueueEventType::JobStarted, record)
                .meta("attempt", json!(record.attempts)),
        )
    }

    pub fn job_progress(&self, record: &JobRecord, progress: u8) -> QueueEvent {
        self.publish(EventDraft::for_job(QueueEventType::JobProgress, record).progress(progress))
    }

    pub fn job_completed(&self, record: &JobRecord, duration_ms: u64) -> QueueEvent {
        self.publish(
            EventDraft::for_job(QueueEventType::JobCompleted, record)
                .progress(100)
                .meta("durationMs", json!(duration_ms)),
        )
    }

    pub fn job_failed(&self, record: &JobRecord, error: &str, class: &str) -> QueueEvent {
        self.publish(
            EventDraft::for_job(QueueEventType::JobFailed, record)
                .error(error)
                .meta("errorClass", json!(class))
                .meta("attempt", json!(record.attempts)),
        )
    }

    pub fn job_retried(&self, record: &JobRecord, delay_ms: u64, error: &str) -> QueueEvent {
        self.publish(
            EventDraft::for_job(QueueEventType::JobRetried, record)
                .error(error)
                .meta("delayMs", json!(delay_ms))
                .meta("attempt", json!(record.attempts))
                .meta("maxAttempts", json!(record.max_attempts)),
        )
    }

    pub fn job_moved_to_dlq(&self, record: &JobRecord, error: &str) -> QueueEvent {
        self.publish(
            EventDraft::for_job(QueueEventType::JobMovedToDlq, record)
                .error(error)
                .meta("attempts", json!(record.attempts)),
        )
    }

    pub fn job_replayed(
        &self,
        original_job_id: JobId,
        replayed: &JobRecord,
        actor_id: Option<ActorId>,
    ) -> QueueEvent {
        self.publish(
            EventDraft::for_job(QueueEventType::JobReplayed, replayed)
                .actor(actor_id.or(replayed.actor_id))
                .meta("originalJobId", json!(original_job_id)),
        )
    }

    pub fn job_cancelled(&self, record: &JobRecord, actor_id: Option<ActorId>) -> QueueEvent {
        self.publish(EventDraft::for_job(QueueEventType::JobCancelled, record).actor(actor_id))
    }

    pub fn job_quarantined(&self, job_type: &str, job_id: JobId, reason: &str, error: &str) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::JobQuarantined)
                .job_type(job_type)
                .job_id(job_id)
                .error(error)
                .meta("reason", json!(reason)),
        )
    }

    pub fn quarantine_released(&self, job_type: &str, job_id: JobId, actor_id: Option<ActorId>) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::QuarantineReleased)
                .job_type(job_type)
                .job_id(job_id)
                .actor(actor_id),
        )
    }

    pub fn quarantine_promoted(&self, job_type: &str, job_id: JobId, actor_id: Option<ActorId>) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::QuarantinePromoted)
                .job_type(job_type)
                .job_id(job_id)
                .actor(actor_id),
        )
    }

    pub fn quarantine_cleared(&self, job_type: &str, removed: u64, actor_id: Option<ActorId>) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::QuarantineCleared)
                .job_type(job_type)
                .actor(actor_id)
                .meta("removed", json!(removed)),
        )
    }

    pub fn dlq_entry_deleted(&self, job_type: &str, job_id: JobId, actor_id: Option<ActorId>) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::DlqEntryDeleted)
                .job_type(job_type)
                .job_id(job_id)
                .actor(actor_id),
        )
    }

    pub fn sla_breached(
        &self,
        job_type: &str,
        queue_name: &str,
        job_id: JobId,
        duration_ms: u64,
        breach_ms: u64,
    ) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::SlaBreached)
                .queue(queue_name)
                .job_type(job_type)
                .job_id(job_id)
                .meta("durationMs", json!(duration_ms))
                .meta("breachMs", json!(breach_ms)),
        )
    }

    pub fn queue_paused(&self, queue_name: &str, actor_id: Option<ActorId>) -> QueueEvent {
        self.publish(EventDraft::new(QueueEventType::QueuePaused).queue(queue_name).actor(actor_id))
    }

    pub fn queue_resumed(&self, queue_name: &str, actor_id: Option<ActorId>) -> QueueEvent {
        self.publish(EventDraft::new(QueueEventType::QueueResumed).queue(queue_name).actor(actor_id))
    }

    pub fn circuit_opened(
        &self,
        dependency: &str,
        failures: u32,
        next_attempt_time: DateTime<Utc>,
    ) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::CircuitOpened)
                .meta("dependency", json!(dependency))
                .meta("failures", json!(failures))
                .meta("nextAttemptTime", json!(next_attempt_time)),
        )
    }

    pub fn circuit_half_opened(&self, dependency: &str) -> QueueEvent {
        self.publish(
            EventDraft::new(QueueEventType::CircuitHalfOpened).meta("dependency", json!(dependency)),
        )
    }

    pub fn circuit_closed(&self, dependency: &str) -> QueueEvent {
        self.publish(EventDraft::new(QueueEventType::CircuitClosed).meta("dependency", json!(dependency)))
    }
}
