//! Job admission: dedupe, idempotency, record creation and transport enqueue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use jobforge_core::{CoreError, JobEnvelope, JobId, JobPriority, JobRecord, DEFAULT_MAX_ATTEMPTS};
use jobforge_events::QueueEvents;

use crate::config::QueueConfig;
use crate::idempotency::{IdempotencyError, IdempotencyOptions, IdempotencyStore, DEFAULT_IDEMPOTENCY_TTL};
use crate::keys::KeySpace;
use crate::kv::{KvError, KvStore};
use crate::persistence::{JobRepository, RepositoryError};
use crate::transport::{QueueMessage, QueueTransport, TransportError, TransportJobOptions};

pub const DEFAULT_JOB_MAPPING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    Validation(#[from] CoreError),
    #[error("duplicate {job_type} job for {entity_key} inside the dedupe window")]
    DedupeRejected { job_type: String, entity_key: String },
    #[error("idempotency key {key} is already being admitted")]
    IdempotencyKeyConflict { key: String },
    #[error("corrupt idempotency state for {key}: {reason}")]
    CorruptIdempotency { key: String, reason: String },
    #[error(transparent)]
    Store(#[from] KvError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<IdempotencyError<ProducerError>> for ProducerError {
    fn from(err: IdempotencyError<ProducerError>) -> Self {
        match err {
            IdempotencyError::Store(e) => ProducerError::Store(e),
            IdempotencyError::Corrupt { key, reason } => ProducerError::CorruptIdempotency { key, reason },
            IdempotencyError::Conflict { key } => ProducerError::IdempotencyKeyConflict { key },
            IdempotencyError::Create(e) => e,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Reject a second job for the same `(jobType, entity)` inside this window.
    pub dedupe_window: Option<Duration>,
    pub delay: Option<Duration>,
    /// Overrides the envelope's priority.
    pub priority: Option<JobPriority>,
    /// Re-admit an idempotency key whose job already finished.
    pub allow_replay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResult {
    pub job_id: JobId,
    pub transport_job_id: Option<String>,
    pub is_new: bool,
}

pub struct Producer {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    idempotency: IdempotencyStore,
    transport: Arc<dyn QueueTransport>,
    jobs: Arc<dyn JobRepository>,
    events: Arc<QueueEvents>,
    max_attempts: u32,
    idempotency_ttl: Duration,
    job_mapping_ttl: Duration,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("keys", &self.keys)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Producer {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeySpace,
        transport: Arc<dyn QueueTransport>,
        jobs: Arc<dyn JobRepository>,
        events: Arc<QueueEvents>,
    ) -> Self {
        Self {
            idempotency: IdempotencyStore::new(kv.clone(), keys.clone()),
            kv,
            keys,
            transport,
            jobs,
            events,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            job_mapping_ttl: DEFAULT_JOB_MAPPING_TTL,
        }
    }

    pub fn configure(mut self, config: &QueueConfig) -> Self {
        self.max_attempts = config.max_attempts;
        self.idempotency_ttl = config.idempotency_ttl();
        self.job_mapping_ttl = config.job_mapping_ttl();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Transport id recorded for an admitted job.
    pub async fn transport_job_id(&self, job_id: JobId) -> Result<Option<String>, KvError> {
        self.kv.get(&self.keys.job_map(job_id)).await
    }

    /// Admit `envelope` at most once per idempotency key.
    #[instrument(
        skip(self, envelope, options),
        fields(job_type = %envelope.job_type, idempotency_key = %envelope.idempotency_key)
    )]
    pub async fn enqueue_job(
        &self,
        mut envelope: JobEnvelope,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult, ProducerError> {
        envelope.validate()?;
        if let Some(priority) = options.priority {
            envelope.priority = priority;
        }

        if let Some(window) = options.dedupe_window {
            let entity_key = envelope.entity.key();
            if !self
                .idempotency
                .check_dedupe(&envelope.job_type, &entity_key, window)
                .await?
            {
                debug!(entity_key = %entity_key, "dedupe window tripped");
                return Err(ProducerError::DedupeRejected {
                    job_type: envelope.job_type.clone(),
                    entity_key,
                });
            }
        }

        let key = envelope.idempotency_key.clone();
        let admission = self
            .idempotency
            .check_or_create(
                &key,
                || self.create_and_enqueue(envelope, options.delay),
                IdempotencyOptions {
                    allow_replay: options.allow_replay,
                    ttl: self.idempotency_ttl,
                },
            )
            .await?;

        match admission.created {
            Some(record) => {
                let transport_job_id = record.transport_job_id.clone();
                if let Some(tid) = &transport_job_id {
                    self.kv
                        .set(&self.keys.job_map(record.id), tid, Some(self.job_mapping_ttl))
                        .await?;
                }
                info!(job_id = %record.id, queue = %record.queue_name, "job enqueued");
                self.events.job_enqueued(&record);
                Ok(EnqueueResult {
                    job_id: record.id,
                    transport_job_id,
                    is_new: true,
                })
            }
            None => {
                let transport_job_id = self.transport_job_id(admission.job_id).await?;
                debug!(job_id = %admission.job_id, "idempotent admission hit");
                Ok(EnqueueResult {
                    job_id: admission.job_id,
                    transport_job_id,
                    is_new: false,
                })
            }
        }
    }

    async fn create_and_enqueue(
        &self,
        envelope: JobEnvelope,
        delay: Option<Duration>,
    ) -> Result<(JobId, JobRecord), ProducerError> {
        let queue = self.keys.queue(&envelope.job_type);
        let mut record = JobRecord::new(envelope, queue.clone(), self.max_attempts);
        self.jobs.create(&record).await?;

        let message = QueueMessage {
            job_id: record.id,
            envelope: record.payload.clone(),
        };
        let options = TransportJobOptions {
            job_id: Some(record.id.to_string()),
            delay,
            attempts: self.max_attempts,
            priority: record.payload.priority.as_u8(),
            ..TransportJobOptions::default()
        };

        match self
            .transport
            .enqueue(&queue, &record.job_type, message, options)
            .await
        {
            Ok(transport_job_id) => {
                record.transport_job_id = Some(transport_job_id);
                self.jobs.update(&record).await?;
                Ok((record.id, record))
            }
            Err(err) => {
                warn!(job_id = %record.id, error = %err, "transport enqueue failed");
                // A WAITING row with no transport job would never run.
                if record.mark_cancelled().is_ok() {
                    record.error_message = Some(format!("enqueue failed: {err}"));
                    if let Err(update_err) = self.jobs.update(&record).await {
                        warn!(job_id = %record.id, error = %update_err, "failed to record enqueue failure");
                    }
                }
                Err(err.into())
            }
        }
    }
}
