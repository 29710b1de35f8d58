use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use super::{
    QueueCounts, QueueMessage, QueueTransport, RetryOutcome, TransportError, TransportJob,
    TransportJobOptions, TransportResult, TransportState,
};

struct Slot {
    job: TransportJob,
    backoff: super::Backoff,
    ready_at: Instant,
    finished: Option<Instant>,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Slot>,
    paused: bool,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    seq: u64,
}

/// In-process transport for tests and single-node development.
///
/// Priority order is lower value first, then enqueue order.
#[derive(Default)]
pub struct InMemoryTransport {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport").finish_non_exhaustive()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> TransportResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| TransportError::Poisoned)
    }

    /// Snapshot of one job, regardless of state.
    pub fn get(&self, queue: &str, id: &str) -> TransportResult<Option<TransportJob>> {
        let inner = self.lock()?;
        Ok(inner
            .queues
            .get(queue)
            .and_then(|q| q.jobs.get(id))
            .map(|slot| current(slot, Instant::now())))
    }
}

/// Delayed jobs whose time has come report as waiting.
fn effective_state(slot: &Slot, now: Instant) -> TransportState {
    match slot.job.state {
        TransportState::Delayed if slot.ready_at <= now => TransportState::Waiting,
        state => state,
    }
}

fn current(slot: &Slot, now: Instant) -> TransportJob {
    let mut job = slot.job.clone();
    job.state = effective_state(slot, now);
    job
}

fn not_found(queue: &str, id: &str) -> TransportError {
    TransportError::NotFound {
        queue: queue.to_string(),
        id: id.to_string(),
    }
}

fn active_slot<'a>(inner: &'a mut Inner, queue: &str, id: &str) -> TransportResult<&'a mut Slot> {
    let slot = inner
        .queues
        .get_mut(queue)
        .and_then(|q| q.jobs.get_mut(id))
        .ok_or_else(|| not_found(queue, id))?;
    if slot.job.state != TransportState::Active {
        return Err(TransportError::InvalidState {
            id: id.to_string(),
            state: slot.job.state,
            expected: TransportState::Active,
        });
    }
    Ok(slot)
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn enqueue(
        &self,
        queue: &str,
        job_name: &str,
        message: QueueMessage,
        options: TransportJobOptions,
    ) -> TransportResult<String> {
        let mut inner = self.lock()?;
        inner.seq += 1;
        let seq = inner.seq;
        let id = options.job_id.clone().unwrap_or_else(|| seq.to_string());
        let state = inner.queues.entry(queue.to_string()).or_default();
        if state.jobs.contains_key(&id) {
            debug!(queue = %queue, transport_job_id = %id, "transport job id already present");
            return Ok(id);
        }

        let now = Instant::now();
        let delay = options.delay.unwrap_or(Duration::ZERO);
        state.jobs.insert(
            id.clone(),
            Slot {
                job: TransportJob {
                    id: id.clone(),
                    queue: queue.to_string(),
                    name: job_name.to_string(),
                    message,
                    state: if delay.is_zero() {
                        TransportState::Waiting
                    } else {
                        TransportState::Delayed
                    },
                    attempts_made: 0,
                    max_attempts: options.attempts.max(1),
                    priority: options.priority,
                    enqueued_at: Utc::now(),
                    finished_at: None,
                    failed_reason: None,
                },
                backoff: options.backoff,
                ready_at: now + delay,
                finished: None,
                seq,
            },
        );
        Ok(id)
    }

    async fn fetch(&self, queue: &str) -> TransportResult<Option<TransportJob>> {
        let mut inner = self.lock()?;
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        if state.paused {
            return Ok(None);
        }
        let now = Instant::now();
        let next = state
            .jobs
            .values_mut()
            .filter(|slot| effective_state(slot, now) == TransportState::Waiting)
            .min_by_key(|slot| (slot.job.priority, slot.ready_at, slot.seq));
        Ok(next.map(|slot| {
            slot.job.state = TransportState::Active;
            slot.job.clone()
        }))
    }

    async fn ack(&self, queue: &str, id: &str) -> TransportResult<()> {
        let mut inner = self.lock()?;
        let slot = active_slot(&mut inner, queue, id)?;
        slot.job.state = TransportState::Completed;
        slot.job.finished_at = Some(Utc::now());
        slot.finished = Some(Instant::now());
        Ok(())
    }

    async fn retry(
        &self,
        queue: &str,
        id: &str,
        delay: Option<Duration>,
        reason: &str,
    ) -> TransportResult<RetryOutcome> {
        let mut inner = self.lock()?;
        let slot = active_slot(&mut inner, queue, id)?;
        slot.job.attempts_made += 1;
        slot.job.failed_reason = Some(reason.to_string());

        if slot.job.attempts_made >= slot.job.max_attempts {
            slot.job.state = TransportState::Failed;
            slot.job.finished_at = Some(Utc::now());
            slot.finished = Some(Instant::now());
            return Ok(RetryOutcome::Exhausted);
        }

        let delay = delay.unwrap_or_else(|| slot.backoff.delay(slot.job.attempts_made));
        slot.job.state = TransportState::Delayed;
        slot.ready_at = Instant::now() + delay;
        Ok(RetryOutcome::Scheduled { delay })
    }

    async fn pause(&self, queue: &str) -> TransportResult<()> {
        self.lock()?.queues.entry(queue.to_string()).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> TransportResult<()> {
        self.lock()?.queues.entry(queue.to_string()).or_default().paused = false;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> TransportResult<bool> {
        Ok(self.lock()?.queues.get(queue).is_some_and(|q| q.paused))
    }

    async fn get_counts(&self, queue: &str) -> TransportResult<QueueCounts> {
        let inner = self.lock()?;
        let mut counts = QueueCounts::default();
        let now = Instant::now();
        for slot in inner.queues.get(queue).into_iter().flat_map(|q| q.jobs.values()) {
            match effective_state(slot, now) {
                TransportState::Waiting => counts.waiting += 1,
                TransportState::Delayed => counts.delayed += 1,
                TransportState::Active => counts.active += 1,
                TransportState::Completed => counts.completed += 1,
                TransportState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn get_jobs(
        &self,
        queue: &str,
        state: TransportState,
        start: usize,
        end: usize,
    ) -> TransportResult<Vec<TransportJob>> {
        let inner = self.lock()?;
        let now = Instant::now();
        let mut slots: Vec<&Slot> = inner
            .queues
            .get(queue)
            .into_iter()
            .flat_map(|q| q.jobs.values())
            .filter(|slot| effective_state(slot, now) == state)
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        Ok(slots
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start).saturating_add(1))
            .map(|slot| current(slot, now))
            .collect())
    }

    async fn remove(&self, queue: &str, id: &str) -> TransportResult<bool> {
        let mut inner = self.lock()?;
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(false);
        };
        match state.jobs.get(id) {
            Some(slot) if slot.job.state == TransportState::Active => Ok(false),
            Some(_) => Ok(state.jobs.remove(id).is_some()),
            None => Ok(false),
        }
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        state: TransportState,
        limit: usize,
    ) -> TransportResult<Vec<String>> {
        let mut inner = self.lock()?;
        let Some(queue_state) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut expired: Vec<(u64, String)> = queue_state
            .jobs
            .values()
            .filter(|slot| slot.job.state == state)
            .filter(|slot| slot.finished.is_some_and(|at| now.duration_since(at) >= grace))
            .map(|slot| (slot.seq, slot.job.id.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit);

        let removed: HashSet<String> = expired.into_iter().map(|(_, id)| id).collect();
        queue_state.jobs.retain(|id, _| !removed.contains(id));
        let mut ids: Vec<String> = removed.into_iter().collect();
        ids.sort();
        Ok(ids)
    }
}
