//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the **notification channel** for queue state transitions. It is
//! never the system of record: job records, DLQ entries and quarantine entries
//! are authoritative, and a lost event loses nothing but a notification.
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, etc.
//! - **Best-effort / at-most-once**: subscribers that are offline miss events
//! - **Broadcast**: every subscription sees every published event

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use thiserror::Error;

/// Publication failure.
#[derive(Debug, Error)]
pub enum BusError {
    /// Internal lock poisoning (in-process buses).
    #[error("event bus lock poisoned")]
    Poisoned,
    #[error("event serialization failed: {0}")]
    Serialize(String),
    #[error("event transport failed: {0}")]
    Transport(String),
}

/// A subscription to an event stream.
///
/// Subscriptions are designed for single-threaded consumption; hand events to
/// other threads through your own channel if needed.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => render(event),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Publish/subscribe broadcaster.
///
/// Object-safe so components can share an `Arc<dyn EventBus<QueueEvent>>`
/// regardless of the backing transport.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
