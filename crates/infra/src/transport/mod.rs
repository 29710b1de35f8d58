//! Queue transport abstraction.
//!
//! The transport owns delivery: delayed scheduling, priorities, attempt
//! counting and pausing. The rest of the engine talks to it only through
//! [`QueueTransport`].

mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{JobEnvelope, JobId};

pub use in_memory::InMemoryTransport;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport lock poisoned")]
    Poisoned,
    #[error("job {id} not found in {queue}")]
    NotFound { queue: String, id: String },
    #[error("job {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: TransportState,
        expected: TransportState,
    },
    #[error("transport backend error: {0}")]
    Backend(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// What travels on the queue: the authoritative job id plus its envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub job_id: JobId,
    pub envelope: JobEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Waiting => "waiting",
            TransportState::Delayed => "delayed",
            TransportState::Active => "active",
            TransportState::Completed => "completed",
            TransportState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay applied by the transport when `retry` is called without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay after `attempts_made` failed attempts (1-based).
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1);
                let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential { delay_ms: 2_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportJobOptions {
    /// Transport-level id; enqueueing an id that already exists is a no-op.
    pub job_id: Option<String>,
    pub delay: Option<Duration>,
    pub attempts: u32,
    pub backoff: Backoff,
    /// Lower runs first.
    pub priority: u8,
}

impl Default for TransportJobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: None,
            attempts: jobforge_core::DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            priority: jobforge_core::JobPriority::default().as_u8(),
        }
    }
}

/// A job as seen by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportJob {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub message: QueueMessage,
    pub state: TransportState,
    /// Attempts that have already finished with a failure.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl TransportJob {
    /// 1-based number of the attempt currently running.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }
}

/// Result of handing a failed attempt back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { delay: Duration },
    /// No attempts left; the job is now `Failed`.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn get(&self, state: TransportState) -> u64 {
        match state {
            TransportState::Waiting => self.waiting,
            TransportState::Delayed => self.delayed,
            TransportState::Active => self.active,
            TransportState::Completed => self.completed,
            TransportState::Failed => self.failed,
        }
    }
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Submit a job and return its transport id.
    async fn enqueue(
        &self,
        queue: &str,
        job_name: &str,
        message: QueueMessage,
        options: TransportJobOptions,
    ) -> TransportResult<String>;

    /// Claim the next ready job. `None` when empty or paused.
    async fn fetch(&self, queue: &str) -> TransportResult<Option<TransportJob>>;

    /// Mark an active job completed.
    async fn ack(&self, queue: &str, id: &str) -> TransportResult<()>;

    /// Record a failed attempt. Reschedules unless attempts are exhausted.
    async fn retry(
        &self,
        queue: &str,
        id: &str,
        delay: Option<Duration>,
        reason: &str,
    ) -> TransportResult<RetryOutcome>;

    async fn pause(&self, queue: &str) -> TransportResult<()>;

    async fn resume(&self, queue: &str) -> TransportResult<()>;

    async fn is_paused(&self, queue: &str) -> TransportResult<bool>;

    async fn get_counts(&self, queue: &str) -> TransportResult<QueueCounts>;

    /// Jobs in `state` ordered oldest first, `start..=end` inclusive.
    async fn get_jobs(
        &self,
        queue: &str,
        state: TransportState,
        start: usize,
        end: usize,
    ) -> TransportResult<Vec<TransportJob>>;

    /// Drop a job that is not currently active. `false` if absent or active.
    async fn remove(&self, queue: &str, id: &str) -> TransportResult<bool>;

    /// Remove up to `limit` finished jobs in `state` older than `grace`; returns their ids.
    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        state: TransportState,
        limit: usize,
    ) -> TransportResult<Vec<String>>;
}
