//! Consumer engine: runs one delivered job through its handler and decides
//! its disposition (completed, retried, dead-lettered).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use jobforge_core::{
    calculate_delay, CoreError, DlqEntry, ErrorClass, JobEnvelope, JobError, JobId, JobRecord,
    JobStatus,
};

use crate::circuit::{CircuitConfig, CircuitError, CircuitPermit};
use crate::dlq::DlqError;
use crate::lock::LockError;
use crate::persistence::{AuditEntry, RepositoryError};
use crate::quarantine::{QuarantineCandidate, QuarantineError, QuarantinedJob};
use crate::runtime::QueueRuntime;
use crate::transport::TransportJob;

/// A downstream system a handler calls, gated by its own circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub name: String,
    /// Per-handler circuit settings; configured overrides still win.
    pub config: Option<CircuitConfig>,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: CircuitConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Exact job type, `prefix.*`, or `*`.
    fn job_type(&self) -> &str;

    fn dependencies(&self) -> Vec<DependencySpec> {
        Vec::new()
    }

    async fn handle(&self, ctx: &JobContext) -> Result<JsonValue, JobError>;
}

/// What a handler sees while it runs.
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based.
    pub attempt: u32,
    pub envelope: JobEnvelope,
    record: JobRecord,
    token: CancellationToken,
    runtime: QueueRuntime,
}

impl JobContext {
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the job was cancelled locally or its record says so.
    pub async fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        matches!(
            self.runtime.jobs.get(self.job_id).await,
            Ok(Some(record)) if record.status == JobStatus::Cancelled
        )
    }

    pub fn report_progress(&self, progress: u8) {
        self.runtime.events.job_progress(&self.record, progress.min(100));
    }

    /// Run `f` holding the lock of the job's entity.
    pub async fn with_entity_lock<T, F, Fut>(&self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let entity = &self.envelope.entity;
        self.runtime
            .locks
            .with_lock(
                &entity.entity_type,
                &entity.id.to_string(),
                self.runtime.locks.defaults(),
                f,
            )
            .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed { result: JsonValue, duration_ms: u64 },
    /// The record was already terminal or got cancelled mid-flight.
    Skipped { status: JobStatus },
    DeadLettered { class: ErrorClass, error: JobError },
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The attempt failed and should be rescheduled by the transport.
    #[error("attempt failed, retry in {delay:?}: {error}")]
    RetryScheduled { delay: Duration, error: JobError },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Dlq(#[from] DlqError),
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
}

/// A failed attempt plus the minimum wait a gated dependency imposes.
struct Failure {
    error: JobError,
    min_delay: Option<Duration>,
}

impl From<JobError> for Failure {
    fn from(error: JobError) -> Self {
        Self {
            error,
            min_delay: None,
        }
    }
}

fn circuit_rejection(err: CircuitError) -> Failure {
    match err {
        CircuitError::Open {
            dependency,
            next_attempt,
        } => Failure {
            error: JobError::new("CircuitOpenError", format!("circuit open for {dependency}"))
                .with_class(ErrorClass::Transient),
            min_delay: next_attempt
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .filter(|d| !d.is_zero()),
        },
        CircuitError::HalfOpenSaturated { dependency } => JobError::new(
            "CircuitOpenError",
            format!("half-open trial limit reached for {dependency}"),
        )
        .with_class(ErrorClass::Transient)
        .into(),
        CircuitError::Failed(never) => match never {},
    }
}

/// Failures that say something about the dependency's health.
fn counts_against_dependency(class: ErrorClass) -> bool {
    matches!(class, ErrorClass::Transient | ErrorClass::RateLimited)
}

pub struct ConsumerEngine {
    runtime: QueueRuntime,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

impl std::fmt::Debug for ConsumerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("ConsumerEngine")
            .field("handlers", &patterns)
            .finish_non_exhaustive()
    }
}

/// Removes a job from the running registry when processing ends.
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<JobId, CancellationToken>>,
    job_id: JobId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.job_id);
        }
    }
}

impl ConsumerEngine {
    pub fn new(runtime: QueueRuntime) -> Self {
        Self {
            runtime,
            handlers: HashMap::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &QueueRuntime {
        &self.runtime
    }

    /// Register under the handler's own `job_type()` pattern.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let pattern = handler.job_type().to_string();
        self.handlers.insert(pattern, handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Exact match, then the longest matching `prefix.*`, then `*`.
    fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                job_type
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());
        if category.is_some() {
            return category;
        }

        self.handlers.get("*").cloned()
    }

    /// Trigger the token of a job running in this process.
    pub fn cancel_local(&self, job_id: JobId) -> bool {
        match self.running.lock() {
            Ok(running) => running.get(&job_id).map(|t| t.cancel()).is_some(),
            Err(_) => false,
        }
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running
            .lock()
            .map(|running| running.contains_key(&job_id))
            .unwrap_or(false)
    }

    fn track(&self, job_id: JobId, token: CancellationToken) -> RunningGuard<'_> {
        if let Ok(mut running) = self.running.lock() {
            running.insert(job_id, token);
        }
        RunningGuard {
            running: &self.running,
            job_id,
        }
    }

    /// Run one delivered job to a disposition.
    ///
    /// `Err(ConsumerError::RetryScheduled)` hands the job back to the
    /// transport; every other outcome is final for this delivery.
    #[instrument(skip(self, job), fields(job_id = %job.message.job_id, job_type = %job.name, attempt = job.attempt()))]
    pub async fn process(&self, job: &TransportJob) -> Result<ProcessOutcome, ConsumerError> {
        let job_id = job.message.job_id;
        let mut record = self.load_record(job).await?;
        if record.status.is_terminal() {
            debug!(status = %record.status, "skipping job in terminal state");
            return Ok(ProcessOutcome::Skipped {
                status: record.status,
            });
        }

        record.mark_active(job.attempt())?;
        record.max_attempts = job.max_attempts;
        self.runtime.jobs.update(&record).await?;
        self.runtime.events.job_started(&record);

        let token = CancellationToken::new();
        let _guard = self.track(job_id, token.clone());

        let started_at = record.started_at.unwrap_or_else(Utc::now);
        let result = self.execute(&record, job.attempt(), token).await;
        let finished_at = Utc::now();
        self.check_sla(&record, started_at, finished_at).await;

        // A cancel that landed while the handler ran wins over its result.
        let mut record = match self.runtime.jobs.get(job_id).await? {
            Some(latest) if latest.status == JobStatus::Cancelled => {
                info!("job cancelled while running; discarding result");
                return Ok(ProcessOutcome::Skipped {
                    status: JobStatus::Cancelled,
                });
            }
            Some(latest) => latest,
            None => record,
        };

        match result {
            Ok(value) => {
                let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
                record.mark_completed()?;
                self.runtime.jobs.update(&record).await?;
                self.runtime.events.job_completed(&record, duration_ms);
                self.sync_idempotency(&record).await;
                info!(duration_ms, "job completed");
                Ok(ProcessOutcome::Completed {
                    result: value,
                    duration_ms,
                })
            }
            Err(failure) => self.handle_failure(record, job, failure).await,
        }
    }

    async fn load_record(&self, job: &TransportJob) -> Result<JobRecord, ConsumerError> {
        let job_id = job.message.job_id;
        if let Some(record) = self.runtime.jobs.get(job_id).await? {
            return Ok(record);
        }
        warn!(job_id = %job_id, "job record missing; recreating from queue message");
        let mut record = JobRecord::new(job.message.envelope.clone(), job.queue.clone(), job.max_attempts);
        record.id = job_id;
        record.transport_job_id = Some(job.id.clone());
        self.runtime.jobs.create(&record).await?;
        Ok(record)
    }

    async fn execute(
        &self,
        record: &JobRecord,
        attempt: u32,
        token: CancellationToken,
    ) -> Result<JsonValue, Failure> {
        let Some(handler) = self.handler_for(&record.job_type) else {
            return Err(JobError::new(
                "NoHandlerError",
                format!("no handler registered for {}", record.job_type),
            )
            .with_class(ErrorClass::Transient)
            .into());
        };

        let mut permits: Vec<CircuitPermit> = Vec::new();
        for dependency in handler.dependencies() {
            let config = self
                .runtime
                .circuits
                .config_for(&dependency.name, dependency.config);
            match self.runtime.circuits.acquire_permit(&dependency.name, config).await {
                Ok(permit) => permits.push(permit),
                Err(err) => {
                    debug!(dependency = %dependency.name, error = %err, "dependency gated");
                    return Err(circuit_rejection(err));
                }
            }
        }

        let ctx = JobContext {
            job_id: record.id,
            attempt,
            envelope: record.payload.clone(),
            record: record.clone(),
            token,
            runtime: self.runtime.clone(),
        };
        let result = handler.handle(&ctx).await;

        let dependency_failed = match &result {
            Ok(_) => false,
            Err(err) => counts_against_dependency(self.runtime.classifier.classify(err).class),
        };
        for permit in &permits {
            if dependency_failed {
                self.runtime.circuits.record_failure(permit).await;
            } else {
                self.runtime.circuits.record_success(permit).await;
            }
        }

        result.map_err(Failure::from)
    }

    async fn check_sla(&self, record: &JobRecord, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
        if let Err(err) = self
            .runtime
            .sla
            .check_sla(record.id, &record.job_type, &record.queue_name, started_at, finished_at)
            .await
        {
            warn!(error = %err, "SLA check failed");
        }
    }

    async fn handle_failure(
        &self,
        mut record: JobRecord,
        job: &TransportJob,
        failure: Failure,
    ) -> Result<ProcessOutcome, ConsumerError> {
        let Failure { error, min_delay } = failure;
        let classification = self.runtime.classifier.classify(&error);
        let class = classification.class;
        self.runtime
            .events
            .job_failed(&record, &error.message, class.as_str());

        if classification.move_to_dlq {
            return self.dead_letter(record, &error, class).await;
        }

        let attempt = job.attempt();
        if classification.should_retry && attempt < job.max_attempts {
            let mut delay = calculate_delay(
                class,
                attempt.saturating_sub(1),
                classification.retry_after_ms,
            );
            if let Some(wait) = min_delay {
                delay = delay.max(wait);
            }
            record.mark_failed(error.to_string())?;
            self.runtime.jobs.update(&record).await?;
            self.sync_idempotency(&record).await;
            let delay_ms = delay.as_millis() as u64;
            self.runtime.events.job_retried(&record, delay_ms, &error.message);
            warn!(class = %class, delay_ms, error = %error, "attempt failed; retry scheduled");
            return Err(ConsumerError::RetryScheduled { delay, error });
        }

        self.dead_letter(record, &error, class).await
    }

    async fn dead_letter(
        &self,
        mut record: JobRecord,
        error: &JobError,
        class: ErrorClass,
    ) -> Result<ProcessOutcome, ConsumerError> {
        let entry = DlqEntry::new(&record, error);
        if !self.runtime.dlq.add(&entry).await? {
            debug!(job_id = %record.id, "dlq entry already written");
        }

        record.mark_dead_lettered(error.to_string())?;
        self.runtime.jobs.update(&record).await?;
        self.runtime.events.job_moved_to_dlq(&record, &error.message);
        self.sync_idempotency(&record).await;

        let audit = AuditEntry::new(
            None,
            "job.moved_to_dlq",
            format!("job:{}", record.id),
            json!({
                "jobType": record.job_type,
                "queue": record.queue_name,
                "class": class.as_str(),
                "error": error.message,
                "attempts": record.attempts,
            }),
        );
        if let Err(err) = self.runtime.audit.append(audit).await {
            warn!(job_id = %record.id, error = %err, "failed to audit dead-lettering");
        }

        warn!(job_id = %record.id, class = %class, error = %error, "job moved to dlq");
        Ok(ProcessOutcome::DeadLettered {
            class,
            error: error.clone(),
        })
    }

    /// Runs once a job has no further attempts: makes sure it is dead-lettered,
    /// then asks the quarantine lane whether its failure pattern is anomalous.
    pub async fn handle_terminal_failure(
        &self,
        job: &TransportJob,
        error: &JobError,
    ) -> Result<Option<QuarantinedJob>, ConsumerError> {
        let job_id = job.message.job_id;
        let mut attempts = job.attempt();
        if let Some(record) = self.runtime.jobs.get(job_id).await? {
            attempts = record.attempts.max(1);
            if record.status.can_transition_to(JobStatus::MovedToDlq) {
                let class = self.runtime.classifier.classify(error).class;
                self.dead_letter(record, error, class).await?;
            }
        }

        let envelope = &job.message.envelope;
        let candidate = QuarantineCandidate {
            job_type: &envelope.job_type,
            job_id,
            attempts,
            error,
            payload: envelope,
        };
        let decision = self.runtime.quarantine.should_quarantine(&candidate).await?;
        match decision.reason {
            Some(reason) if decision.quarantine => {
                Ok(Some(self.runtime.quarantine.add_job(&candidate, reason).await?))
            }
            _ => Ok(None),
        }
    }

    async fn sync_idempotency(&self, record: &JobRecord) {
        if let Err(err) = self
            .runtime
            .idempotency
            .update_status(&record.idempotency_key, record.status, self.runtime.config.idempotency_ttl())
            .await
        {
            warn!(job_id = %record.id, error = %err, "failed to update idempotency status");
        }
    }
}
