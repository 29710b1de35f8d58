//! Queue lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use jobforge_core::{ActorId, EntityRef, EventId, JobId, JobRecord, JobStatus, TenantId, WorkspaceId};

/// Kind of state transition being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueEventType {
    JobEnqueued,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobRetried,
    JobMovedToDlq,
    JobReplayed,
    JobCancelled,
    JobQuarantined,
    QuarantineReleased,
    QuarantinePromoted,
    QuarantineCleared,
    DlqEntryDeleted,
    SlaBreached,
    QueuePaused,
    QueueResumed,
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
}

/// A fully populated event as seen by subscribers.
///
/// `id` and `timestamp` are assigned by the emitter at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: QueueEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, JsonValue>>,
}

/// An event before the emitter stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: QueueEventType,
    pub queue_name: Option<String>,
    pub job_type: Option<String>,
    pub job_id: Option<JobId>,
    pub transport_job_id: Option<String>,
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub trace_id: Option<String>,
    pub entity: Option<EntityRef>,
    pub actor_id: Option<ActorId>,
    pub tenant_id: Option<TenantId>,
    pub workspace_id: Option<WorkspaceId>,
    pub error_summary: Option<String>,
    pub metadata: Option<Map<String, JsonValue>>,
}

/// Longest error summary carried on an event.
pub const MAX_ERROR_SUMMARY_LEN: usize = 500;

impl EventDraft {
    pub fn new(event_type: QueueEventType) -> Self {
        Self {
            event_type,
            queue_name: None,
            job_type: None,
            job_id: None,
            transport_job_id: None,
            status: None,
            progress: None,
            trace_id: None,
            entity: None,
            actor_id: None,
            tenant_id: None,
            workspace_id: None,
            error_summary: None,
            metadata: None,
        }
    }

    /// Draft pre-filled with everything known about a job.
    pub fn for_job(event_type: QueueEventType, record: &JobRecord) -> Self {
        Self {
            queue_name: Some(record.queue_name.clone()),
            job_type: Some(record.job_type.clone()),
            job_id: Some(record.id),
            transport_job_id: record.transport_job_id.clone(),
            status: Some(record.status),
            trace_id: Some(record.trace_id.clone()),
            entity: Some(record.entity.clone()),
            actor_id: record.actor_id,
            tenant_id: record.tenant_id,
            workspace_id: record.payload.workspace_id,
            ..Self::new(event_type)
        }
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn actor(mut self, actor_id: Option<ActorId>) -> Self {
        self.actor_id = actor_id;
        self
    }

    /// Attach an error summary, truncated to [`MAX_ERROR_SUMMARY_LEN`] characters.
    pub fn error(mut self, summary: impl AsRef<str>) -> Self {
        self.error_summary = Some(summary.as_ref().chars().take(MAX_ERROR_SUMMARY_LEN).collect());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub(crate) fn stamp(self, id: EventId, timestamp: DateTime<Utc>) -> QueueEvent {
        QueueEvent {
            id,
            event_type: self.event_type,
            timestamp,
            queue_name: self.queue_name,
            job_type: self.job_type,
            job_id: self.job_id,
            transport_job_id: self.transport_job_id,
            status: self.status,
            progress: self.progress,
            trace_id: self.trace_id,
            entity: self.entity,
            actor_id: self.actor_id,
            tenant_id: self.tenant_id,
            workspace_id: self.workspace_id,
            error_summary: self.error_summary,
            metadata: self.metadata,
        }
    }
}
