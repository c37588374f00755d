//! NATS connection wrapper.
//!
//! One connection per process serves the update queue producer, every
//! partition consumer, the broadcaster and the broadcast relay.

use pixelwar_core::config::{BroadcastConfig, QueueConfig};
use tracing::{debug, info};

use crate::broadcast::NatsBroadcaster;
use crate::error::BusError;
use crate::queue::{JetStreamQueue, JetStreamSource};

/// NATS client wrapper.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
}

impl NatsBus {
    /// Connect to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connect`] if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        info!(url = url, "connecting to NATS server");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(format!("failed to connect to {url}: {e}")))?;
        info!("NATS connection established");
        let jetstream = async_nats::jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    /// Producer side of the update queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::JetStream`] if the stream cannot be created.
    pub async fn queue(&self, config: &QueueConfig) -> Result<JetStreamQueue, BusError> {
        JetStreamQueue::new(self.jetstream.clone(), config.clone()).await
    }

    /// Consumer of one queue partition.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::JetStream`] if the consumer cannot be attached.
    pub async fn source(
        &self,
        config: &QueueConfig,
        partition: u32,
    ) -> Result<JetStreamSource, BusError> {
        JetStreamSource::new(&self.jetstream, config, partition).await
    }

    /// Broadcaster publishing on this connection.
    pub fn broadcaster(&self, config: &BroadcastConfig) -> NatsBroadcaster {
        NatsBroadcaster::new(self.client.clone(), config.clone())
    }

    /// Subscribe to `channel`'s broadcasts.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connect`] if the subscription fails.
    pub async fn subscribe_broadcasts(
        &self,
        config: &BroadcastConfig,
        channel: &str,
    ) -> Result<async_nats::Subscriber, BusError> {
        let subject = config.subject(channel);
        debug!(subject = %subject, "subscribing to broadcast subject");
        self.client
            .subscribe(subject.clone())
            .await
            .map_err(|e| BusError::Connect(format!("failed to subscribe to {subject}: {e}")))
    }

    /// Flush all pending messages to the NATS server.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Publish`] if the flush operation fails.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Publish(format!("flush failed: {e}")))
    }
}

impl std::fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBus")
            .field("connected", &true)
            .finish()
    }
}
