//! Worker loop: pulls jobs from the transport and drives the consumer engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::{ConsumerEngine, ConsumerError, ProcessOutcome};
use crate::transport::{QueueTransport, RetryOutcome, TransportError, TransportJob};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging.
    pub name: String,
    /// Transport queue names to consume.
    pub queues: Vec<String>,
    /// Concurrent jobs per queue.
    pub concurrency: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "jobforge-worker".to_string(),
            queues: Vec::new(),
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_retried: u64,
    pub jobs_skipped: u64,
    pub jobs_quarantined: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

struct Shared {
    engine: Arc<ConsumerEngine>,
    transport: Arc<dyn QueueTransport>,
    config: WorkerConfig,
    stats: Mutex<WorkerStats>,
}

impl Shared {
    fn stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

pub struct Worker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    started: Instant,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").field("config", &self.config).finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(worker = %self.shared.config.name, error = %err, "worker task panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

impl Worker {
    pub fn new(engine: Arc<ConsumerEngine>, config: WorkerConfig) -> Self {
        let transport = engine.runtime().transport.clone();
        Self {
            shared: Arc::new(Shared {
                engine,
                transport,
                config,
                stats: Mutex::new(WorkerStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Spawn one polling task per queue on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let tasks = self
            .shared
            .config
            .queues
            .iter()
            .map(|queue| {
                tokio::spawn(queue_loop(
                    self.shared.clone(),
                    queue.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        WorkerHandle {
            shutdown,
            tasks,
            shared: self.shared,
            started: Instant::now(),
        }
    }

    /// Fetch and fully handle one job from `queue`. Returns `false` if none was ready.
    pub async fn run_once(&self, queue: &str) -> Result<bool, TransportError> {
        match self.shared.transport.fetch(queue).await? {
            Some(job) => {
                handle_job(&self.shared, job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn queue_loop(shared: Arc<Shared>, queue: String, shutdown: CancellationToken) {
    let concurrency = shared.config.concurrency.max(1);
    let slots = Arc::new(Semaphore::new(concurrency));
    info!(worker = %shared.config.name, queue = %queue, concurrency, "worker started");

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let idle = match shared.transport.fetch(&queue).await {
            Ok(Some(job)) => {
                debug!(worker = %shared.config.name, queue = %queue, transport_job_id = %job.id, "claimed job");
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_job(&shared, job).await;
                    drop(permit);
                });
                false
            }
            Ok(None) => true,
            Err(err) => {
                error!(worker = %shared.config.name, queue = %queue, error = %err, "failed to fetch job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(shared.config.poll_interval) => {}
            }
        }
    }

    // Wait for in-flight jobs.
    let _drained = slots.acquire_many(concurrency as u32).await;
    info!(worker = %shared.config.name, queue = %queue, "worker stopped");
}

async fn handle_job(shared: &Shared, job: TransportJob) {
    shared.stats(|s| s.current_running += 1);
    let outcome = shared.engine.process(&job).await;

    match outcome {
        Ok(ProcessOutcome::Completed { .. }) => {
            ack(shared, &job).await;
            shared.stats(|s| s.jobs_succeeded += 1);
        }
        Ok(ProcessOutcome::Skipped { status }) => {
            debug!(transport_job_id = %job.id, status = %status, "job skipped");
            ack(shared, &job).await;
            shared.stats(|s| s.jobs_skipped += 1);
        }
        Ok(ProcessOutcome::DeadLettered { error, .. }) => {
            ack(shared, &job).await;
            shared.stats(|s| {
                s.jobs_failed += 1;
                s.jobs_dead_lettered += 1;
            });
            terminal_failure(shared, &job, &error).await;
        }
        Err(ConsumerError::RetryScheduled { delay, error }) => {
            match shared
                .transport
                .retry(&job.queue, &job.id, Some(delay), &error.message)
                .await
            {
                Ok(RetryOutcome::Scheduled { .. }) => shared.stats(|s| s.jobs_retried += 1),
                Ok(RetryOutcome::Exhausted) => {
                    shared.stats(|s| {
                        s.jobs_failed += 1;
                        s.jobs_dead_lettered += 1;
                    });
                    terminal_failure(shared, &job, &error).await;
                }
                Err(err) => {
                    error!(transport_job_id = %job.id, error = %err, "failed to reschedule job");
                    shared.stats(|s| s.jobs_failed += 1);
                }
            }
        }
        Err(err) => {
            // Infrastructure failure: let the transport's own backoff apply.
            error!(transport_job_id = %job.id, error = %err, "job processing failed");
            shared.stats(|s| s.jobs_failed += 1);
            if let Err(retry_err) = shared
                .transport
                .retry(&job.queue, &job.id, None, &err.to_string())
                .await
            {
                error!(transport_job_id = %job.id, error = %retry_err, "failed to reschedule job");
            }
        }
    }

    shared.stats(|s| {
        s.current_running = s.current_running.saturating_sub(1);
        s.jobs_processed += 1;
    });
}

async fn ack(shared: &Shared, job: &TransportJob) {
    if let Err(err) = shared.transport.ack(&job.queue, &job.id).await {
        warn!(transport_job_id = %job.id, error = %err, "failed to ack job");
    }
}

async fn terminal_failure(shared: &Shared, job: &TransportJob, error: &jobforge_core::JobError) {
    match shared.engine.handle_terminal_failure(job, error).await {
        Ok(Some(_)) => shared.stats(|s| s.jobs_quarantined += 1),
        Ok(None) => {}
        Err(err) => error!(transport_job_id = %job.id, error = %err, "terminal failure handling failed"),
    }
}
