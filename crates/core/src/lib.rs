//! `jobforge-core`: job envelope, job record and failure-policy building blocks.
//!
//! This crate is **pure**: no IO, no async. Everything that touches the shared
//! store, the transport or the database lives in `jobforge-infra`.

pub mod classifier;
pub mod envelope;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use classifier::{
    classify, extract_retry_after_ms, Classification, ClassifierRule, ErrorClass, ErrorClassifier,
    JobError,
};
pub use envelope::{EntityId, EntityRef, JobEnvelope, JobPriority, MAX_IDEMPOTENCY_KEY_LEN};
pub use error::{CoreError, CoreResult};
pub use id::{ActorId, EventId, JobId, TenantId, WorkspaceId};
pub use job::{DlqEntry, ErrorSnapshot, JobRecord, JobStatus, DEFAULT_MAX_ATTEMPTS};
pub use retry::{calculate_delay, delay_with_jitter, MAX_RETRY_DELAY_MS};
