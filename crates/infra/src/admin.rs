//! Operator-facing queue operations. Authorization happens upstream; every
//! mutating call takes the acting user's id and writes an audit entry.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use jobforge_core::{ActorId, CoreError, DlqEntry, JobId, JobStatus};
use jobforge_events::{EventFilter, FilteredSubscription, QueueEvent};

use crate::circuit::CircuitStatus;
use crate::consumer::ConsumerEngine;
use crate::dlq::DlqError;
use crate::kv::KvError;
use crate::persistence::{AuditEntry, RepositoryError};
use crate::producer::{EnqueueOptions, Producer, ProducerError};
use crate::quarantine::{QuarantineError, QuarantineStats, QuarantinedJob};
use crate::runtime::QueueRuntime;
use crate::sla::{SlaDegradation, SlaError, SlaStats};
use crate::transport::{QueueCounts, TransportError};

/// Backlog above which a queue with idle workers is reported unhealthy.
pub const STALLED_BACKLOG: u64 = 1_000;
/// Backlog above which a queue is reported degraded.
pub const DEGRADED_BACKLOG: u64 = 100;
/// DLQ size at which a queue is reported unhealthy.
pub const UNHEALTHY_DLQ_SIZE: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error(transparent)]
    Dlq(#[from] DlqError),
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Store(#[from] KvError),
    #[error(transparent)]
    Sla(#[from] SlaError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Paused,
}

impl QueueHealth {
    pub fn assess(counts: &QueueCounts, paused: bool, dlq_size: u64, quarantine_size: u64) -> Self {
        let backlog = counts.waiting + counts.delayed;
        if paused {
            QueueHealth::Paused
        } else if dlq_size >= UNHEALTHY_DLQ_SIZE || (counts.active == 0 && backlog >= STALLED_BACKLOG) {
            QueueHealth::Unhealthy
        } else if dlq_size > 0 || quarantine_size > 0 || backlog >= DEGRADED_BACKLOG {
            QueueHealth::Degraded
        } else {
            QueueHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOverview {
    pub job_type: String,
    pub queue_name: String,
    pub counts: QueueCounts,
    pub paused: bool,
    pub dlq_size: u64,
    pub quarantine_size: u64,
    pub health: QueueHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub original_job_id: JobId,
    pub job_id: JobId,
    pub is_new: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReplayReport {
    pub replayed: Vec<ReplayResult>,
    pub failed: Vec<(JobId, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CancelOutcome {
    Cancelled {
        transport_removed: bool,
        interrupted: bool,
    },
    AlreadyFinished {
        status: JobStatus,
    },
}

pub struct QueueAdmin {
    runtime: QueueRuntime,
    producer: Producer,
    engine: Option<Arc<ConsumerEngine>>,
    job_types: BTreeSet<String>,
}

impl std::fmt::Debug for QueueAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueAdmin")
            .field("job_types", &self.job_types)
            .finish_non_exhaustive()
    }
}

impl QueueAdmin {
    pub fn new(runtime: QueueRuntime) -> Self {
        Self {
            producer: runtime.producer(),
            runtime,
            engine: None,
            job_types: BTreeSet::new(),
        }
    }

    /// Lets `cancel_job` interrupt jobs running in this process.
    pub fn with_engine(mut self, engine: Arc<ConsumerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Job types always listed by [`QueueAdmin::overviews`].
    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_types.extend(job_types.into_iter().map(Into::into));
        self
    }

    async fn audit(&self, actor_id: ActorId, action: &str, resource: String, payload: serde_json::Value) {
        let entry = AuditEntry::new(Some(actor_id), action, resource, payload);
        if let Err(err) = self.runtime.audit.append(entry).await {
            warn!(action = %action, error = %err, "failed to write audit entry");
        }
    }

    pub async fn overview(&self, job_type: &str) -> Result<QueueOverview, AdminError> {
        let queue_name = self.runtime.keys.queue(job_type);
        let counts = self.runtime.transport.get_counts(&queue_name).await?;
        let paused = self.runtime.transport.is_paused(&queue_name).await?;
        let dlq_size = self.runtime.dlq.count(job_type).await?;
        let quarantine_size = self.runtime.quarantine.count(job_type).await?;
        Ok(QueueOverview {
            job_type: job_type.to_string(),
            health: QueueHealth::assess(&counts, paused, dlq_size, quarantine_size),
            queue_name,
            counts,
            paused,
            dlq_size,
            quarantine_size,
        })
    }

    /// Overviews for configured job types plus any with DLQ or quarantine entries.
    pub async fn overviews(&self) -> Result<Vec<QueueOverview>, AdminError> {
        let mut job_types = self.job_types.clone();
        job_types.extend(self.runtime.dlq.job_types().await?);
        job_types.extend(self.runtime.quarantine.get_stats().await?.by_job_type.into_keys());

        let mut overviews = Vec::with_capacity(job_types.len());
        for job_type in &job_types {
            overviews.push(self.overview(job_type).await?);
        }
        Ok(overviews)
    }

    pub async fn pause_queue(&self, job_type: &str, actor_id: ActorId) -> Result<(), AdminError> {
        let queue_name = self.runtime.keys.queue(job_type);
        self.runtime.transport.pause(&queue_name).await?;
        info!(queue = %queue_name, actor_id = %actor_id, "queue paused");
        self.runtime.events.queue_paused(&queue_name, Some(actor_id));
        self.audit(actor_id, "queue.pause", queue_name, json!({ "jobType": job_type }))
            .await;
        Ok(())
    }

    pub async fn resume_queue(&self, job_type: &str, actor_id: ActorId) -> Result<(), AdminError> {
        let queue_name = self.runtime.keys.queue(job_type);
        self.runtime.transport.resume(&queue_name).await?;
        info!(queue = %queue_name, actor_id = %actor_id, "queue resumed");
        self.runtime.events.queue_resumed(&queue_name, Some(actor_id));
        self.audit(actor_id, "queue.resume", queue_name, json!({ "jobType": job_type }))
            .await;
        Ok(())
    }

    pub async fn list_dlq(
        &self,
        job_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DlqEntry>, AdminError> {
        Ok(self.runtime.dlq.list(job_type, offset, limit).await?)
    }

    /// Re-admit a dead-lettered job as a new job and drop the DLQ entry.
    pub async fn replay_dlq(
        &self,
        job_type: &str,
        job_id: JobId,
        actor_id: ActorId,
    ) -> Result<ReplayResult, AdminError> {
        let entry = self
            .runtime
            .dlq
            .get(job_type, job_id)
            .await?
            .ok_or_else(|| AdminError::NotFound {
                what: format!("dlq entry {job_type}/{job_id}"),
            })?;

        let admitted = self
            .producer
            .enqueue_job(
                entry.payload.clone(),
                EnqueueOptions {
                    allow_replay: true,
                    ..EnqueueOptions::default()
                },
            )
            .await?;
        self.runtime.dlq.remove(job_type, job_id).await?;

        if let Some(replayed) = self.runtime.jobs.get(admitted.job_id).await? {
            self.runtime
                .events
                .job_replayed(job_id, &replayed, Some(actor_id));
        }
        info!(original_job_id = %job_id, job_id = %admitted.job_id, "dlq entry replayed");
        self.audit(
            actor_id,
            "dlq.replay",
            format!("job:{job_id}"),
            json!({ "jobType": job_type, "newJobId": admitted.job_id, "isNew": admitted.is_new }),
        )
        .await;

        Ok(ReplayResult {
            original_job_id: job_id,
            job_id: admitted.job_id,
            is_new: admitted.is_new,
        })
    }

    /// Replay up to `limit` of the newest entries; failures don't stop the batch.
    pub async fn bulk_replay_dlq(
        &self,
        job_type: &str,
        limit: usize,
        actor_id: ActorId,
    ) -> Result<BulkReplayReport, AdminError> {
        let entries = self.runtime.dlq.list(job_type, 0, limit).await?;
        let mut report = BulkReplayReport::default();
        for entry in entries {
            match self.replay_dlq(job_type, entry.original_job_id, actor_id).await {
                Ok(result) => report.replayed.push(result),
                Err(err) => {
                    warn!(job_id = %entry.original_job_id, error = %err, "bulk replay entry failed");
                    report.failed.push((entry.original_job_id, err.to_string()));
                }
            }
        }
        Ok(report)
    }

    pub async fn delete_dlq(
        &self,
        job_type: &str,
        job_id: JobId,
        actor_id: ActorId,
    ) -> Result<bool, AdminError> {
        let removed = self.runtime.dlq.remove(job_type, job_id).await?;
        if removed {
            self.runtime
                .events
                .dlq_entry_deleted(job_type, job_id, Some(actor_id));
            self.audit(actor_id, "dlq.delete", format!("job:{job_id}"), json!({ "jobType": job_type }))
                .await;
        }
        Ok(removed)
    }

    pub async fn list_quarantine(
        &self,
        job_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<QuarantinedJob>, AdminError> {
        Ok(self.runtime.quarantine.list_jobs(job_type, offset, limit).await?)
    }

    pub async fn promote_quarantine(
        &self,
        job_type: &str,
        job_id: JobId,
        actor_id: ActorId,
    ) -> Result<DlqEntry, AdminError> {
        let record = self.runtime.jobs.get(job_id).await?;
        let entry = self
            .runtime
            .quarantine
            .promote_to_dlq(job_type, job_id, record.as_ref(), &self.runtime.dlq, Some(actor_id))
            .await?;
        self.audit(
            actor_id,
            "quarantine.promote",
            format!("job:{job_id}"),
            json!({ "jobType": job_type }),
        )
        .await;
        Ok(entry)
    }

    pub async fn delete_quarantine(
        &self,
        job_type: &str,
        job_id: JobId,
        actor_id: ActorId,
    ) -> Result<bool, AdminError> {
        let removed = self
            .runtime
            .quarantine
            .remove_job(job_type, job_id, Some(actor_id))
            .await?;
        if removed {
            self.audit(
                actor_id,
                "quarantine.delete",
                format!("job:{job_id}"),
                json!({ "jobType": job_type }),
            )
            .await;
        }
        Ok(removed)
    }

    pub async fn clear_quarantine(&self, job_type: &str, actor_id: ActorId) -> Result<u64, AdminError> {
        let removed = self
            .runtime
            .quarantine
            .clear_quarantine(job_type, Some(actor_id))
            .await?;
        self.audit(
            actor_id,
            "quarantine.clear",
            format!("quarantine:{job_type}"),
            json!({ "removed": removed }),
        )
        .await;
        Ok(removed)
    }

    pub async fn quarantine_stats(&self) -> Result<QuarantineStats, AdminError> {
        Ok(self.runtime.quarantine.get_stats().await?)
    }

    pub async fn circuit_status(&self, dependency: &str) -> Result<CircuitStatus, AdminError> {
        Ok(self.runtime.circuits.get_status(dependency).await?)
    }

    pub async fn all_circuits(&self) -> Result<Vec<CircuitStatus>, AdminError> {
        Ok(self.runtime.circuits.all_circuits().await?)
    }

    pub async fn reset_circuit(&self, dependency: &str, actor_id: ActorId) -> Result<(), AdminError> {
        self.runtime.circuits.reset_circuit(dependency).await?;
        self.audit(
            actor_id,
            "circuit.reset",
            format!("circuit:{dependency}"),
            json!({}),
        )
        .await;
        Ok(())
    }

    pub async fn sla_stats(&self, job_type: &str, hours: u32) -> Result<SlaStats, AdminError> {
        Ok(self.runtime.sla.get_sla_stats(job_type, hours).await?)
    }

    pub async fn sla_degradation(
        &self,
        job_type: &str,
        hours: u32,
        threshold_pct: f64,
    ) -> Result<SlaDegradation, AdminError> {
        Ok(self
            .runtime
            .sla
            .check_sla_degradation(job_type, hours, threshold_pct)
            .await?)
    }

    pub fn subscribe_events(&self, filter: EventFilter) -> FilteredSubscription {
        self.runtime.events.subscribe_filtered(filter)
    }

    pub fn recent_events(&self, since: Option<DateTime<Utc>>, limit: usize) -> Vec<QueueEvent> {
        self.runtime.events.recent(since, limit)
    }

    /// Cancel a job that has not finished yet.
    ///
    /// A handler already running in this process sees its token fire; one
    /// running elsewhere notices through `JobContext::is_cancelled`.
    pub async fn cancel_job(&self, job_id: JobId, actor_id: ActorId) -> Result<CancelOutcome, AdminError> {
        let mut record = self
            .runtime
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| AdminError::NotFound {
                what: format!("job {job_id}"),
            })?;
        if record.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished {
                status: record.status,
            });
        }

        record.mark_cancelled()?;
        self.runtime.jobs.update(&record).await?;

        let transport_removed = match &record.transport_job_id {
            Some(tid) => match self.runtime.transport.remove(&record.queue_name, tid).await {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "failed to remove transport job");
                    false
                }
            },
            None => false,
        };
        let interrupted = self
            .engine
            .as_ref()
            .is_some_and(|engine| engine.cancel_local(job_id));

        if let Err(err) = self
            .runtime
            .idempotency
            .update_status(&record.idempotency_key, JobStatus::Cancelled, self.runtime.config.idempotency_ttl())
            .await
        {
            warn!(job_id = %job_id, error = %err, "failed to update idempotency status");
        }
        self.runtime.events.job_cancelled(&record, Some(actor_id));
        info!(job_id = %job_id, actor_id = %actor_id, transport_removed, interrupted, "job cancelled");
        self.audit(
            actor_id,
            "job.cancel",
            format!("job:{job_id}"),
            json!({ "jobType": record.job_type, "transportRemoved": transport_removed }),
        )
        .await;

        Ok(CancelOutcome::Cancelled {
            transport_removed,
            interrupted,
        })
    }
}
