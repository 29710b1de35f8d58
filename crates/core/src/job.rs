//! Authoritative job record, its status machine, and dead-letter entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::JobError;
use crate::envelope::{EntityRef, JobEnvelope};
use crate::error::{CoreError, CoreResult};
use crate::id::{ActorId, JobId, TenantId};

/// Default attempt ceiling for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Admitted, waiting for a worker
    Waiting,
    /// Picked up by a worker
    Active,
    /// Completed successfully
    Completed,
    /// Failed; the transport may still retry it
    Failed,
    /// Cancelled by an operator
    Cancelled,
    /// Routed to the dead-letter queue
    MovedToDlq,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::MovedToDlq
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::MovedToDlq => "moved_to_dlq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "moved_to_dlq" => Some(JobStatus::MovedToDlq),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// Terminal states accept nothing. The only way back to `Waiting` is a
    /// transport-driven retry of a failed attempt.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Waiting, Active | Cancelled) => true,
            (Active, Completed | Failed | Cancelled | MovedToDlq) => true,
            (Failed, Active | Waiting | Cancelled | MovedToDlq) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The system-of-record row for one admitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub queue_name: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub idempotency_key: String,
    pub trace_id: String,
    pub tenant_id: Option<TenantId>,
    pub actor_id: Option<ActorId>,
    pub entity: EntityRef,
    pub payload: JobEnvelope,
    pub transport_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobRecord {
    /// Create a `Waiting` record for an admitted envelope.
    pub fn new(envelope: JobEnvelope, queue_name: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: envelope.job_type.clone(),
            queue_name: queue_name.into(),
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts,
            idempotency_key: envelope.idempotency_key.clone(),
            trace_id: envelope.trace_id.clone(),
            tenant_id: envelope.tenant_id,
            actor_id: envelope.actor_id,
            entity: envelope.entity.clone(),
            payload: envelope,
            transport_job_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error_message: None,
        }
    }

    /// Move to `next`, refusing regressions.
    pub fn transition(&mut self, next: JobStatus) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark picked up for the given 1-indexed attempt.
    ///
    /// A record that is already `Active` belongs to a stalled delivery the
    /// transport handed out again; it is re-stamped in place.
    pub fn mark_active(&mut self, attempt: u32) -> CoreResult<()> {
        if self.status == JobStatus::Active {
            self.updated_at = Utc::now();
        } else {
            self.transition(JobStatus::Active)?;
        }
        self.attempts = attempt;
        self.started_at = Some(self.updated_at);
        self.finished_at = None;
        Ok(())
    }

    pub fn mark_completed(&mut self) -> CoreResult<()> {
        self.transition(JobStatus::Completed)?;
        self.finished_at = Some(self.updated_at);
        self.error_message = None;
        Ok(())
    }

    /// Record a failed attempt that the transport will retry.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> CoreResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    pub fn mark_dead_lettered(&mut self, error: impl Into<String>) -> CoreResult<()> {
        self.transition(JobStatus::MovedToDlq)?;
        self.finished_at = Some(self.updated_at);
        self.error_message = Some(error.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> CoreResult<()> {
        self.transition(JobStatus::Cancelled)?;
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Error as captured on a dead-letter entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&JobError> for ErrorSnapshot {
    fn from(error: &JobError) -> Self {
        Self {
            name: error.name.clone(),
            message: error.message.clone(),
            code: error.code.clone(),
            stack: error.stack.clone(),
        }
    }
}

/// Entry in the dead-letter queue. Keeps the full original payload for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub original_job_id: JobId,
    pub original_queue: String,
    pub job_type: String,
    pub attempts_made: u32,
    pub failed_at: DateTime<Utc>,
    pub error: ErrorSnapshot,
    pub payload: JobEnvelope,
}

impl DlqEntry {
    pub fn new(record: &JobRecord, error: &JobError) -> Self {
        Self {
            original_job_id: record.id,
            original_queue: record.queue_name.clone(),
            job_type: record.job_type.clone(),
            attempts_made: record.attempts,
            failed_at: Utc::now(),
            error: ErrorSnapshot::from(error),
            payload: record.payload.clone(),
        }
    }
}
