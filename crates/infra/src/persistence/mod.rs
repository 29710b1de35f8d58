//! System-of-record persistence: job rows and the audit log.

mod in_memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobforge_core::{ActorId, JobId, JobRecord};

pub use in_memory::{InMemoryAuditLog, InMemoryJobRepository};
pub use postgres::{PgAuditLog, PgJobRepository};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("repository lock poisoned")]
    Poisoned,
    #[error("storage error: {0}")]
    Storage(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, record: &JobRecord) -> RepositoryResult<()>;

    async fn get(&self, job_id: JobId) -> RepositoryResult<Option<JobRecord>>;

    /// Overwrite an existing row.
    async fn update(&self, record: &JobRecord) -> RepositoryResult<()>;
}

/// One administrative or lifecycle action worth keeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub actor_id: Option<ActorId>,
    pub action: String,
    pub resource: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor_id: Option<ActorId>,
        action: impl Into<String>,
        resource: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            actor_id,
            action: action.into(),
            resource: resource.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> RepositoryResult<()>;
}
