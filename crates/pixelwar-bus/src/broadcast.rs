//! Core NATS broadcaster.
//!
//! Channel `c` is published on `{broadcast.subject_prefix}.{c}`. Core NATS
//! keeps nothing for absent subscribers, so delivery is at most once.

use pixelwar_core::broadcast::Broadcaster;
use pixelwar_core::config::BroadcastConfig;
use pixelwar_core::error::StoreError;

/// Publishes pixel broadcasts to every API instance.
#[derive(Clone)]
pub struct NatsBroadcaster {
    client: async_nats::Client,
    config: BroadcastConfig,
}

impl NatsBroadcaster {
    /// Build a broadcaster on an existing connection.
    pub const fn new(client: async_nats::Client, config: BroadcastConfig) -> Self {
        Self { client, config }
    }

    /// Subject carrying `channel`.
    pub fn subject(&self, channel: &str) -> String {
        self.config.subject(channel)
    }
}

impl Broadcaster for NatsBroadcaster {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        let subject = self.subject(channel);
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| StoreError::Unavailable(format!("publish to {subject}: {e}")))
    }
}

impl std::fmt::Debug for NatsBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroadcaster")
            .field("subject_prefix", &self.config.subject_prefix)
            .finish()
    }
}
