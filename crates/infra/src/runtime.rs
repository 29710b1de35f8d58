//! Wiring of the shared collaborators every queue component needs.

use std::sync::Arc;

use jobforge_core::ErrorClassifier;
use jobforge_events::{EventBus, InMemoryEventBus, QueueEvent, QueueEvents};

use crate::circuit::CircuitBreaker;
use crate::config::QueueConfig;
use crate::dlq::DeadLetterQueue;
use crate::idempotency::IdempotencyStore;
use crate::keys::KeySpace;
use crate::kv::{InMemoryKvStore, KvStore};
use crate::lock::LockManager;
use crate::persistence::{AuditLog, InMemoryAuditLog, InMemoryJobRepository, JobRepository};
use crate::producer::Producer;
use crate::quarantine::QuarantineLane;
use crate::sla::SlaMonitor;
use crate::transport::{InMemoryTransport, QueueTransport};

/// Explicitly constructed handles shared by producer, consumer, worker and admin.
#[derive(Clone)]
pub struct QueueRuntime {
    pub config: QueueConfig,
    pub keys: KeySpace,
    pub kv: Arc<dyn KvStore>,
    pub events: Arc<QueueEvents>,
    pub transport: Arc<dyn QueueTransport>,
    pub jobs: Arc<dyn JobRepository>,
    pub audit: Arc<dyn AuditLog>,
    pub classifier: Arc<ErrorClassifier>,
    pub idempotency: IdempotencyStore,
    pub locks: LockManager,
    pub circuits: Arc<CircuitBreaker>,
    pub quarantine: Arc<QuarantineLane>,
    pub sla: Arc<SlaMonitor>,
    pub dlq: DeadLetterQueue,
}

impl std::fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueRuntime {
    pub fn new(
        config: QueueConfig,
        kv: Arc<dyn KvStore>,
        bus: Arc<dyn EventBus<QueueEvent>>,
        transport: Arc<dyn QueueTransport>,
        jobs: Arc<dyn JobRepository>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        let keys = config.keys();
        let events = Arc::new(QueueEvents::new(bus));
        let classifier = Arc::new(ErrorClassifier::default());

        let circuits = config.circuit_overrides.iter().fold(
            CircuitBreaker::new(kv.clone(), keys.clone(), events.clone())
                .with_defaults(config.circuit_defaults),
            |breaker, (dependency, cfg)| breaker.with_override(dependency.clone(), *cfg),
        );

        Self {
            idempotency: IdempotencyStore::new(kv.clone(), keys.clone()),
            locks: LockManager::new(kv.clone(), keys.clone()).with_defaults(config.lock),
            circuits: Arc::new(circuits),
            quarantine: Arc::new(
                QuarantineLane::new(kv.clone(), keys.clone(), events.clone())
                    .with_classifier(classifier.clone()),
            ),
            sla: Arc::new(SlaMonitor::new(
                kv.clone(),
                keys.clone(),
                events.clone(),
                config.sla.clone(),
            )),
            dlq: DeadLetterQueue::new(kv.clone(), keys.clone()),
            config,
            keys,
            kv,
            events,
            transport,
            jobs,
            audit,
            classifier,
        }
    }

    /// Everything in process memory. For tests and local development.
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(InMemoryTransport::new()),
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(InMemoryAuditLog::new()),
        )
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            self.kv.clone(),
            self.keys.clone(),
            self.transport.clone(),
            self.jobs.clone(),
            self.events.clone(),
        )
        .configure(&self.config)
    }
}
