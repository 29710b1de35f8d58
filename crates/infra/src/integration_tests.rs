//! End-to-end flows through producer, worker, consumer engine and admin.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use jobforge_core::{ActorId, EntityRef, ErrorClass, JobEnvelope, JobError, JobId, JobStatus};
use jobforge_events::{EventFilter, InMemoryEventBus, QueueEventType};

use crate::admin::{CancelOutcome, QueueAdmin, QueueHealth};
use crate::circuit::{CircuitConfig, CircuitState};
use crate::config::QueueConfig;
use crate::consumer::{ConsumerEngine, DependencySpec, JobContext, JobHandler};
use crate::kv::InMemoryKvStore;
use crate::persistence::{InMemoryAuditLog, InMemoryJobRepository};
use crate::producer::EnqueueOptions;
use crate::quarantine::QuarantineReason;
use crate::runtime::QueueRuntime;
use crate::transport::InMemoryTransport;
use crate::worker::{Worker, WorkerConfig};

const JOB_TYPE: &str = "report.render";
const QUEUE: &str = "it:queue:report.render";
const OPERATOR: ActorId = ActorId::new(9);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Succeed,
    Poison,
    Timeout,
    WaitForCancel,
}

struct ReportHandler {
    mode: std::sync::Mutex<Mode>,
    deps: Vec<DependencySpec>,
    calls: AtomicUsize,
    entered: AtomicBool,
}

impl ReportHandler {
    fn new(mode: Mode) -> Self {
        Self {
            mode: std::sync::Mutex::new(mode),
            deps: Vec::new(),
            calls: AtomicUsize::new(0),
            entered: AtomicBool::new(false),
        }
    }

    fn with_dependency(mut self, dep: DependencySpec) -> Self {
        self.deps.push(dep);
        self
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ReportHandler {
    fn job_type(&self) -> &str {
        "report.*"
    }

    fn dependencies(&self) -> Vec<DependencySpec> {
        self.deps.clone()
    }

    async fn handle(&self, ctx: &JobContext) -> Result<JsonValue, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Succeed => {
                ctx.report_progress(50);
                Ok(json!({ "pages": 3 }))
            }
            Mode::Poison => Err(JobError::classified(ErrorClass::Poison, "template is corrupt")),
            Mode::Timeout => Err(JobError::message("renderer timed out")),
            Mode::WaitForCancel => {
                self.entered.store(true, Ordering::SeqCst);
                ctx.cancellation_token().cancelled().await;
                Ok(json!({ "aborted": true }))
            }
        }
    }
}

struct Harness {
    runtime: QueueRuntime,
    engine: Arc<ConsumerEngine>,
    handler: Arc<ReportHandler>,
    admin: QueueAdmin,
    audit: Arc<InMemoryAuditLog>,
}

fn harness(handler: ReportHandler) -> Harness {
    let audit = Arc::new(InMemoryAuditLog::new());
    let runtime = QueueRuntime::new(
        QueueConfig {
            namespace: "it".into(),
            ..QueueConfig::default()
        },
        Arc::new(InMemoryKvStore::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(InMemoryTransport::new()),
        Arc::new(InMemoryJobRepository::new()),
        audit.clone(),
    );
    let handler = Arc::new(handler);
    let engine = Arc::new(ConsumerEngine::new(runtime.clone()).with_handler(handler.clone()));
    let admin = QueueAdmin::new(runtime.clone())
        .with_engine(engine.clone())
        .with_job_types([JOB_TYPE]);
    Harness {
        runtime,
        engine,
        handler,
        admin,
        audit,
    }
}

impl Harness {
    fn worker(&self) -> Worker {
        Worker::new(self.engine.clone(), WorkerConfig::default().with_queue(QUEUE))
    }

    async fn enqueue(&self, key: &str) -> JobId {
        let envelope = JobEnvelope::new(JOB_TYPE, key, EntityRef::new("report", key));
        self.runtime
            .producer()
            .enqueue_job(envelope, EnqueueOptions::default())
            .await
            .unwrap()
            .job_id
    }

    async fn status(&self, job_id: JobId) -> JobStatus {
        self.runtime.jobs.get(job_id).await.unwrap().unwrap().status
    }
}

#[tokio::test(start_paused = true)]
async fn enqueued_job_runs_to_completion_once() {
    let h = harness(ReportHandler::new(Mode::Succeed));
    let events = h
        .runtime
        .events
        .subscribe_filtered(EventFilter::all().job_type(JOB_TYPE));

    let job_id = h.enqueue("monthly-2026-09").await;
    let again = h
        .runtime
        .producer()
        .enqueue_job(
            JobEnvelope::new(JOB_TYPE, "monthly-2026-09", EntityRef::new("report", "monthly-2026-09")),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(again.job_id, job_id);
    assert!(!again.is_new);

    let handle = Worker::new(
        h.engine.clone(),
        WorkerConfig::default()
            .with_queue(QUEUE)
            .with_poll_interval(Duration::from_millis(10)),
    )
    .spawn();
    while handle.stats().jobs_processed < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.shutdown().await;

    assert_eq!(h.status(job_id).await, JobStatus::Completed);
    assert_eq!(h.handler.calls(), 1);
    let idem = h.runtime.idempotency.get("monthly-2026-09").await.unwrap().unwrap();
    assert_eq!(idem.status, JobStatus::Completed);

    let kinds: Vec<_> = events.drain().into_iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        [
            QueueEventType::JobEnqueued,
            QueueEventType::JobStarted,
            QueueEventType::JobProgress,
            QueueEventType::JobCompleted,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn poison_job_is_dead_lettered_quarantined_and_replayed() {
    let h = harness(ReportHandler::new(Mode::Poison));
    let worker = h.worker();
    let job_id = h.enqueue("broken-template").await;

    assert!(worker.run_once(QUEUE).await.unwrap());
    assert_eq!(h.status(job_id).await, JobStatus::MovedToDlq);
    assert_eq!(worker.stats().jobs_dead_lettered, 1);
    assert_eq!(worker.stats().jobs_quarantined, 1);

    let quarantined = h.admin.list_quarantine(JOB_TYPE, 0, 10).await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason, QuarantineReason::PoisonPill);

    let overview = h.admin.overview(JOB_TYPE).await.unwrap();
    assert_eq!(overview.dlq_size, 1);
    assert_eq!(overview.health, QueueHealth::Degraded);

    h.handler.set_mode(Mode::Succeed);
    let replay = h.admin.replay_dlq(JOB_TYPE, job_id, OPERATOR).await.unwrap();
    assert!(replay.is_new);
    assert!(worker.run_once(QUEUE).await.unwrap());
    assert_eq!(h.status(replay.job_id).await, JobStatus::Completed);
    assert_eq!(h.runtime.dlq.count(JOB_TYPE).await.unwrap(), 0);

    assert!(h.admin.delete_quarantine(JOB_TYPE, job_id, OPERATOR).await.unwrap());
    assert_eq!(
        h.audit.actions(),
        ["job.moved_to_dlq", "dlq.replay", "quarantine.delete"]
    );
}

#[tokio::test(start_paused = true)]
async fn open_circuit_defers_jobs_without_calling_handler() {
    let smtp = DependencySpec::new("renderer").with_config(CircuitConfig {
        failure_threshold: 1,
        ..CircuitConfig::default()
    });
    let h = harness(ReportHandler::new(Mode::Timeout).with_dependency(smtp));
    let worker = h.worker();
    let first = h.enqueue("a").await;
    let second = h.enqueue("b").await;

    assert!(worker.run_once(QUEUE).await.unwrap());
    assert_eq!(h.status(first).await, JobStatus::Failed);
    assert_eq!(h.admin.circuit_status("renderer").await.unwrap().state, CircuitState::Open);

    assert!(worker.run_once(QUEUE).await.unwrap());
    assert_eq!(h.status(second).await, JobStatus::Failed);
    assert_eq!(h.handler.calls(), 1);
    assert_eq!(worker.stats().jobs_retried, 2);

    let opened = h
        .admin
        .recent_events(None, 100)
        .into_iter()
        .filter(|e| e.event_type == QueueEventType::CircuitOpened)
        .count();
    assert_eq!(opened, 1);

    h.admin.reset_circuit("renderer", OPERATOR).await.unwrap();
    assert_eq!(h.admin.circuit_status("renderer").await.unwrap().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiting_job_never_runs() {
    let h = harness(ReportHandler::new(Mode::Succeed));
    let worker = h.worker();
    let job_id = h.enqueue("skip-me").await;

    let outcome = h.admin.cancel_job(job_id, OPERATOR).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Cancelled {
            transport_removed: true,
            interrupted: false
        }
    );
    assert!(!worker.run_once(QUEUE).await.unwrap());
    assert_eq!(h.handler.calls(), 0);
    assert_eq!(h.status(job_id).await, JobStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_running_job_discards_its_result() {
    let h = harness(ReportHandler::new(Mode::WaitForCancel));
    let worker = Arc::new(h.worker());
    let job_id = h.enqueue("long-running").await;

    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run_once(QUEUE).await })
    };
    while !h.handler.entered.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.engine.is_running(job_id));

    let outcome = h.admin.cancel_job(job_id, OPERATOR).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Cancelled {
            transport_removed: false,
            interrupted: true
        }
    );
    assert!(running.await.unwrap().unwrap());

    assert_eq!(h.status(job_id).await, JobStatus::Cancelled);
    assert_eq!(worker.stats().jobs_skipped, 1);
    assert!(!h.engine.is_running(job_id));
    let cancelled = h
        .admin
        .recent_events(None, 100)
        .into_iter()
        .any(|e| e.event_type == QueueEventType::JobCancelled && e.actor_id == Some(OPERATOR));
    assert!(cancelled);
}
