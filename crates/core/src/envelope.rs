//! Job envelope: the admission contract for work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::id::{ActorId, TenantId, WorkspaceId};

/// Maximum length (in characters) of an idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Scheduling priority. Lower numeric value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum JobPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl JobPriority {
    pub const fn as_u8(self) -> u8 {
        match self {
            JobPriority::Critical => 1,
            JobPriority::High => 3,
            JobPriority::Normal => 5,
            JobPriority::Low => 7,
            JobPriority::Background => 10,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TryFrom<u8> for JobPriority {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Critical),
            3 => Ok(Self::High),
            5 => Ok(Self::Normal),
            7 => Ok(Self::Low),
            10 => Ok(Self::Background),
            other => Err(CoreError::validation(format!(
                "priority must be one of 1, 3, 5, 7, 10 (got {other})"
            ))),
        }
    }
}

impl From<JobPriority> for u8 {
    fn from(value: JobPriority) -> Self {
        value.as_u8()
    }
}

/// Entity identifier as it appears on the wire (string or integer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Number(i64),
    Text(String),
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EntityId::Number(n) => write!(f, "{n}"),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// The business entity a job operates on (used for locking, dedupe and abuse detection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// `type:id`, the key used by dedupe windows and entity locks.
    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type, self.id)
    }
}

fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A work item as submitted by a producer.
///
/// Wire shape is camelCase JSON. `traceId` and `createdAt` are optional on the
/// wire and filled in on deserialization when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub job_type: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default = "generate_trace_id")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    pub entity: EntityRef,
    #[serde(default)]
    pub meta: Map<String, JsonValue>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(
        job_type: impl Into<String>,
        idempotency_key: impl Into<String>,
        entity: EntityRef,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            idempotency_key: idempotency_key.into(),
            priority: JobPriority::default(),
            trace_id: generate_trace_id(),
            actor_id: None,
            tenant_id: None,
            workspace_id: None,
            entity,
            meta: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_actor(mut self, actor_id: ActorId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_workspace(mut self, workspace_id: WorkspaceId) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Check the admission invariants.
    pub fn validate(&self) -> CoreResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(CoreError::validation("jobType must not be empty"));
        }
        if self.idempotency_key.is_empty() {
            return Err(CoreError::validation("idempotencyKey must not be empty"));
        }
        let key_len = self.idempotency_key.chars().count();
        if key_len > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(CoreError::validation(format!(
                "idempotencyKey must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters (got {key_len})"
            )));
        }
        if self.entity.entity_type.trim().is_empty() {
            return Err(CoreError::validation("entity.type must not be empty"));
        }
        if matches!(&self.entity.id, EntityId::Text(id) if id.is_empty()) {
            return Err(CoreError::validation("entity.id must not be empty"));
        }
        Ok(())
    }
}
