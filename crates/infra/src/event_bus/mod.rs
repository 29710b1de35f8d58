//! Infrastructure-backed event buses.
//!
//! The bus abstraction and the in-process implementation live in
//! `jobforge-events`; this module adds transports that fan out across
//! processes.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubEventBus;
