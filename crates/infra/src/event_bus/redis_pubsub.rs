//! Redis pub/sub event bus.
//!
//! Pub/sub is not durable: a subscriber that is offline misses events. That
//! matches the bus contract, since job records stay the system of record.

use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use jobforge_events::{BusError, EventBus, Subscription};

/// Publishes JSON-encoded messages on one Redis channel.
#[derive(Debug)]
pub struct RedisPubSubEventBus<M> {
    client: redis::Client,
    channel: String,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for RedisPubSubEventBus<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            channel: self.channel.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> RedisPubSubEventBus<M> {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
            _message: PhantomData,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl<M> EventBus<M> for RedisPubSubEventBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(&message).map_err(|e| BusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| BusError::Transport(e.to_string()))?;
        debug!(channel = %self.channel, receivers, "event published");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();
        let channel = self.channel.clone();

        // The forwarding thread exits once the subscription is dropped or the
        // connection fails; the receiver then reports disconnection.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(channel = %channel, error = %err, "event subscription connect failed");
                    return;
                }
            };
            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %err, "event subscription failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "event subscription closed");
                        return;
                    }
                };
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                let message: M = match serde_json::from_str(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(channel = %channel, error = %err, "skipping undecodable event");
                        continue;
                    }
                };
                if tx.send(message).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
