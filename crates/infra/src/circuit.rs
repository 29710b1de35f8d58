//! Per-dependency circuit breaker with state shared through the KV store.
//!
//! Execution is split into `acquire_permit` / `record_success` /
//! `record_failure` so one handler call can be gated by several dependencies;
//! [`CircuitBreaker::execute`] composes them for the single-dependency case.
//!
//! The HALF_OPEN trial counter is per process and therefore a soft cap.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use jobforge_events::QueueEvents;

use crate::keys::KeySpace;
use crate::kv::{KvError, KvStore};

const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub dependency: String,
    pub state: CircuitState,
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_time: Option<DateTime<Utc>>,
}

impl CircuitStatus {
    pub fn closed(dependency: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            state: CircuitState::Closed,
            failures: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E = Infallible> {
    /// Calls are being rejected until `next_attempt`.
    #[error("circuit open for {dependency}")]
    Open {
        dependency: String,
        next_attempt: Option<DateTime<Utc>>,
    },
    #[error("circuit half-open for {dependency} and trial calls are exhausted")]
    HalfOpenSaturated { dependency: String },
    #[error("{0}")]
    Failed(E),
}

impl CircuitError {
    /// Re-type a rejection for a caller with a concrete failure type.
    pub fn widen<E>(self) -> CircuitError<E> {
        match self {
            CircuitError::Open {
                dependency,
                next_attempt,
            } => CircuitError::Open {
                dependency,
                next_attempt,
            },
            CircuitError::HalfOpenSaturated { dependency } => {
                CircuitError::HalfOpenSaturated { dependency }
            }
            CircuitError::Failed(never) => match never {},
        }
    }
}

/// Permission to make one call against a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitPermit {
    pub dependency: String,
    pub config: CircuitConfig,
    /// Issued while HALF_OPEN.
    pub trial: bool,
}

pub struct CircuitBreaker {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    events: Arc<QueueEvents>,
    defaults: CircuitConfig,
    overrides: HashMap<String, CircuitConfig>,
    half_open_calls: Mutex<HashMap<String, u32>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("defaults", &self.defaults)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace, events: Arc<QueueEvents>) -> Self {
        Self {
            kv,
            keys,
            events,
            defaults: CircuitConfig::default(),
            overrides: HashMap::new(),
            half_open_calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(mut self, defaults: CircuitConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_override(mut self, dependency: impl Into<String>, config: CircuitConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    /// Configured override for `dependency`, else the supplied fallback, else defaults.
    pub fn config_for(&self, dependency: &str, fallback: Option<CircuitConfig>) -> CircuitConfig {
        self.overrides
            .get(dependency)
            .copied()
            .or(fallback)
            .unwrap_or(self.defaults)
    }

    async fn load(&self, dependency: &str) -> Result<(Option<String>, CircuitStatus), KvError> {
        let raw = self.kv.get(&self.keys.circuit(dependency)).await?;
        let status = match raw.as_deref().map(serde_json::from_str::<CircuitStatus>) {
            Some(Ok(status)) => status,
            Some(Err(err)) => {
                warn!(dependency = %dependency, error = %err, "discarding corrupt circuit state");
                CircuitStatus::closed(dependency)
            }
            None => CircuitStatus::closed(dependency),
        };
        Ok((raw, status))
    }

    async fn store(
        &self,
        dependency: &str,
        previous: Option<&str>,
        next: &CircuitStatus,
    ) -> Result<bool, KvError> {
        let encoded = serde_json::to_string(next).unwrap_or_default();
        let swapped = self
            .kv
            .compare_and_swap(&self.keys.circuit(dependency), previous, &encoded, Some(STATE_TTL))
            .await?;
        if swapped && previous.is_none() {
            self.kv.sadd(&self.keys.circuits(), dependency).await?;
        }
        Ok(swapped)
    }

    fn half_open_counter(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.half_open_calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn get_status(&self, dependency: &str) -> Result<CircuitStatus, KvError> {
        Ok(self.load(dependency).await?.1)
    }

    pub async fn all_circuits(&self) -> Result<Vec<CircuitStatus>, KvError> {
        let mut out = Vec::new();
        for dependency in self.kv.smembers(&self.keys.circuits()).await? {
            out.push(self.get_status(&dependency).await?);
        }
        Ok(out)
    }

    /// Administrative reset to CLOSED.
    pub async fn reset_circuit(&self, dependency: &str) -> Result<(), KvError> {
        self.kv.del(&self.keys.circuit(dependency)).await?;
        self.half_open_counter().remove(dependency);
        info!(dependency = %dependency, "circuit reset");
        self.events.circuit_closed(dependency);
        Ok(())
    }

    /// Decide whether a call may proceed. Store failures fail open.
    pub async fn acquire_permit(
        &self,
        dependency: &str,
        config: CircuitConfig,
    ) -> Result<CircuitPermit, CircuitError> {
        match self.try_acquire(dependency, config).await {
            Ok(permit) => permit,
            Err(err) => {
                warn!(dependency = %dependency, error = %err, "circuit state unavailable; allowing call");
                Ok(CircuitPermit {
                    dependency: dependency.to_string(),
                    config,
                    trial: false,
                })
            }
        }
    }

    async fn try_acquire(
        &self,
        dependency: &str,
        config: CircuitConfig,
    ) -> Result<Result<CircuitPermit, CircuitError>, KvError> {
        for _ in 0..CAS_ATTEMPTS {
            let (raw, status) = self.load(dependency).await?;
            match status.state {
                CircuitState::Closed => {
                    return Ok(Ok(CircuitPermit {
                        dependency: dependency.to_string(),
                        config,
                        trial: false,
                    }));
                }
                CircuitState::Open => {
                    let now = Utc::now();
                    if status.next_attempt_time.is_some_and(|at| now < at) {
                        return Ok(Err(CircuitError::Open {
                            dependency: dependency.to_string(),
                            next_attempt: status.next_attempt_time,
                        }));
                    }
                    let half_open = CircuitStatus {
                        state: CircuitState::HalfOpen,
                        next_attempt_time: None,
                        ..status
                    };
                    if self.store(dependency, raw.as_deref(), &half_open).await? {
                        self.half_open_counter().insert(dependency.to_string(), 0);
                        info!(dependency = %dependency, "circuit half-open");
                        self.events.circuit_half_opened(dependency);
                    }
                }
                CircuitState::HalfOpen => {
                    let mut counter = self.half_open_counter();
                    let calls = counter.entry(dependency.to_string()).or_insert(0);
                    if *calls >= config.half_open_max_calls {
                        return Ok(Err(CircuitError::HalfOpenSaturated {
                            dependency: dependency.to_string(),
                        }));
                    }
                    *calls += 1;
                    return Ok(Ok(CircuitPermit {
                        dependency: dependency.to_string(),
                        config,
                        trial: true,
                    }));
                }
            }
        }
        Ok(Ok(CircuitPermit {
            dependency: dependency.to_string(),
            config,
            trial: false,
        }))
    }

    /// Report a successful call: resets failures, and closes a HALF_OPEN
    /// circuit when `permit` was a trial.
    pub async fn record_success(&self, permit: &CircuitPermit) {
        if let Err(err) = self.try_record(permit, true).await {
            warn!(dependency = %permit.dependency, error = %err, "failed to record circuit success");
        }
    }

    /// Report a failed call: may open (or re-open) the circuit.
    pub async fn record_failure(&self, permit: &CircuitPermit) {
        if let Err(err) = self.try_record(permit, false).await {
            warn!(dependency = %permit.dependency, error = %err, "failed to record circuit failure");
        }
    }

    async fn try_record(&self, permit: &CircuitPermit, success: bool) -> Result<(), KvError> {
        let dependency = permit.dependency.as_str();
        for _ in 0..CAS_ATTEMPTS {
            let (raw, status) = self.load(dependency).await?;
            let previous_state = status.state;

            let next = if success {
                match previous_state {
                    CircuitState::Closed if status.failures == 0 => return Ok(()),
                    CircuitState::Closed => CircuitStatus {
                        failures: 0,
                        ..status
                    },
                    // Only a trial call may close the circuit; an OPEN circuit
                    // waits for its timeout whatever stragglers report.
                    CircuitState::HalfOpen if permit.trial => CircuitStatus::closed(dependency),
                    CircuitState::HalfOpen | CircuitState::Open => return Ok(()),
                }
            } else {
                let now = Utc::now();
                let failures = status.failures.saturating_add(1);
                let reopen = match previous_state {
                    CircuitState::Closed => failures >= permit.config.failure_threshold,
                    CircuitState::HalfOpen => true,
                    CircuitState::Open => false,
                };
                CircuitStatus {
                    dependency: dependency.to_string(),
                    state: if reopen { CircuitState::Open } else { previous_state },
                    failures,
                    last_failure_time: Some(now),
                    next_attempt_time: if reopen {
                        Some(now + chrono::Duration::milliseconds(permit.config.reset_timeout_ms as i64))
                    } else {
                        status.next_attempt_time
                    },
                }
            };

            if !self.store(dependency, raw.as_deref(), &next).await? {
                continue;
            }

            match (previous_state, next.state) {
                (CircuitState::Closed, CircuitState::Closed) => {}
                (_, CircuitState::Closed) => {
                    self.half_open_counter().remove(dependency);
                    info!(dependency = %dependency, "circuit closed");
                    self.events.circuit_closed(dependency);
                }
                (CircuitState::Open, CircuitState::Open) => {}
                (_, CircuitState::Open) => {
                    let next_attempt = next.next_attempt_time.unwrap_or_else(Utc::now);
                    warn!(
                        dependency = %dependency,
                        failures = next.failures,
                        next_attempt = %next_attempt,
                        "circuit opened"
                    );
                    self.events.circuit_opened(dependency, next.failures, next_attempt);
                }
                _ => {}
            }
            return Ok(());
        }
        warn!(dependency = %dependency, "circuit state contended; outcome not recorded");
        Ok(())
    }

    /// Run `f` through the breaker for `dependency`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        dependency: &str,
        config: CircuitConfig,
        f: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self
            .acquire_permit(dependency, config)
            .await
            .map_err(CircuitError::widen)?;
        match f().await {
            Ok(value) => {
                self.record_success(&permit).await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&permit).await;
                Err(CircuitError::Failed(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::kv::InMemoryKvStore;
    use jobforge_events::{InMemoryEventBus, QueueEventType};

    fn breaker() -> (CircuitBreaker, Arc<QueueEvents>) {
        let events = Arc::new(QueueEvents::new(Arc::new(InMemoryEventBus::new())));
        let breaker = CircuitBreaker::new(
            Arc::new(InMemoryKvStore::new()),
            KeySpace::new("test"),
            events.clone(),
        );
        (breaker, events)
    }

    fn fast() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 5,
            reset_timeout_ms: 200,
            half_open_max_calls: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), CircuitError<&'static str>> {
        breaker
            .execute("openai", fast(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            })
            .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let (breaker, events) = breaker();
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            assert!(matches!(fail(&breaker, &calls).await, Err(CircuitError::Failed("boom"))));
        }
        assert_eq!(breaker.get_status("openai").await.unwrap().state, CircuitState::Closed);

        assert!(fail(&breaker, &calls).await.is_err());
        let status = breaker.get_status("openai").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failures, 5);
        assert!(status.next_attempt_time.is_some());

        let rejected = fail(&breaker, &calls).await;
        assert!(matches!(rejected, Err(CircuitError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let opened = events
            .recent(None, 100)
            .into_iter()
            .filter(|e| e.event_type == QueueEventType::CircuitOpened)
            .count();
        assert_eq!(opened, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (breaker, _) = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&breaker, &calls).await;
        }
        breaker
            .execute("openai", fast(), || async { Ok::<_, &str>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.get_status("openai").await.unwrap().failures, 0);
    }

    #[tokio::test]
    async fn half_open_trial_success_closes() {
        let (breaker, events) = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let value = breaker
            .execute("openai", fast(), || async { Ok::<_, &str>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let status = breaker.get_status("openai").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failures, 0);
        assert!(status.next_attempt_time.is_none());

        let kinds: Vec<_> = events.recent(None, 100).into_iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&QueueEventType::CircuitHalfOpened));
        assert!(kinds.contains(&QueueEventType::CircuitClosed));
    }

    #[tokio::test]
    async fn half_open_trial_failure_reopens() {
        let (breaker, _) = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(matches!(fail(&breaker, &calls).await, Err(CircuitError::Failed(_))));
        let status = breaker.get_status("openai").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert!(matches!(fail(&breaker, &calls).await, Err(CircuitError::Open { .. })));
    }

    #[tokio::test]
    async fn late_success_does_not_close_an_open_circuit() {
        let (breaker, events) = breaker();
        let calls = AtomicUsize::new(0);
        let slow = breaker.acquire_permit("openai", fast()).await.unwrap();
        assert!(!slow.trial);

        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        breaker.record_success(&slow).await;

        let status = breaker.get_status("openai").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failures, 5);
        assert!(matches!(fail(&breaker, &calls).await, Err(CircuitError::Open { .. })));
        assert!(
            !events
                .recent(None, 100)
                .iter()
                .any(|e| e.event_type == QueueEventType::CircuitClosed)
        );
    }

    #[tokio::test]
    async fn non_trial_success_leaves_half_open_circuit_waiting_for_trial() {
        let (breaker, _) = breaker();
        let calls = AtomicUsize::new(0);
        let slow = breaker.acquire_permit("openai", fast()).await.unwrap();
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let trial = breaker.acquire_permit("openai", fast()).await.unwrap();
        assert!(trial.trial);
        breaker.record_success(&slow).await;
        assert_eq!(breaker.get_status("openai").await.unwrap().state, CircuitState::HalfOpen);

        breaker.record_success(&trial).await;
        assert_eq!(breaker.get_status("openai").await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_caps_trial_calls() {
        let (breaker, _) = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let trial = breaker.acquire_permit("openai", fast()).await.unwrap();
        assert!(trial.trial);
        let second = breaker.acquire_permit("openai", fast()).await;
        assert!(matches!(second, Err(CircuitError::HalfOpenSaturated { .. })));
    }

    #[tokio::test]
    async fn reset_clears_state_and_lists_known_circuits() {
        let (breaker, _) = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        let all = breaker.all_circuits().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, CircuitState::Open);

        breaker.reset_circuit("openai").await.unwrap();
        assert_eq!(breaker.get_status("openai").await.unwrap(), CircuitStatus::closed("openai"));
    }

    #[test]
    fn overrides_win_over_handler_config() {
        let (breaker, _) = breaker();
        let custom = CircuitConfig {
            failure_threshold: 2,
            ..CircuitConfig::default()
        };
        let breaker = breaker.with_override("smtp", custom);
        assert_eq!(breaker.config_for("smtp", None), custom);
        assert_eq!(breaker.config_for("openai", Some(fast())), fast());
        assert_eq!(breaker.config_for("openai", None), CircuitConfig::default());
    }
}
