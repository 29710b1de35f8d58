//! Queue infrastructure: shared stores, producer, consumer engine, workers
//! and the operator surface.
//!
//! Everything is wired through [`runtime::QueueRuntime`], which owns the
//! key-value store, transport, job repository, audit log and event emitter.
//! Backends are traits so Redis/Postgres and in-memory implementations are
//! interchangeable.

pub mod admin;
pub mod circuit;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event_bus;
pub mod idempotency;
pub mod keys;
pub mod kv;
pub mod lock;
pub mod persistence;
pub mod producer;
pub mod quarantine;
pub mod runtime;
pub mod sla;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use admin::{AdminError, QueueAdmin, QueueHealth, QueueOverview};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, CircuitStatus};
pub use config::{ConfigError, QueueConfig};
pub use consumer::{ConsumerEngine, ConsumerError, DependencySpec, JobContext, JobHandler, ProcessOutcome};
pub use dlq::{DeadLetterQueue, DlqError};
pub use idempotency::{IdempotencyError, IdempotencyStore};
pub use keys::KeySpace;
pub use kv::{InMemoryKvStore, KvError, KvStore};
pub use lock::{LockError, LockManager, LockOptions};
pub use producer::{EnqueueOptions, EnqueueResult, Producer, ProducerError};
pub use quarantine::{QuarantineLane, QuarantineReason, QuarantinedJob};
pub use runtime::QueueRuntime;
pub use sla::{SlaMonitor, SlaTable, SlaThreshold};
pub use transport::{InMemoryTransport, QueueTransport, TransportError};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};
