//! Fire-and-forget fan-out of applied updates to live subscribers.
//!
//! Delivery is at-most-once: a slow or disconnected subscriber misses
//! messages, and nothing on the write path waits for subscribers.

use std::future::Future;

use tokio::sync::broadcast;

use crate::error::StoreError;

/// Publisher of serialized messages on a named channel.
pub trait Broadcaster: Send + Sync + 'static {
    /// Publish `payload` to every current subscriber of `channel`.
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A message relayed by [`LocalBroadcaster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Logical channel.
    pub channel: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

/// In-process broadcaster over a tokio broadcast channel.
///
/// Cheap to clone; every clone publishes to the same subscribers.
#[derive(Debug, Clone)]
pub struct LocalBroadcaster {
    tx: broadcast::Sender<ChannelMessage>,
}

impl LocalBroadcaster {
    /// Create a broadcaster buffering up to `capacity` messages per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish without awaiting. Having no subscriber is not an error.
    pub fn send(&self, channel: &str, payload: Vec<u8>) {
        let message = ChannelMessage {
            channel: channel.to_owned(),
            payload,
        };
        if self.tx.send(message).is_err() {
            tracing::trace!(channel, "No live subscribers");
        }
    }
}

impl Broadcaster for LocalBroadcaster {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        self.send(channel, payload);
        Ok(())
    }
}
