//! `JetStream` work queue carrying [`UpdateMessage`]s.
//!
//! | Item | Name |
//! |------|------|
//! | Stream | `{queue.stream}`, work-queue retention |
//! | Subject of partition `p` | `{queue.subject_prefix}.{p}` |
//! | Durable consumer of partition `p` | `{queue.durable_prefix}-{p}` |
//!
//! Each consumer allows one unacknowledged message at a time, so a
//! partition's messages are applied strictly in order. A failed message is
//! NAKed with a delay and blocks its partition until it applies. With the
//! default `max_deliver = -1` the broker never gives up on it. Publishes
//! carry the message id as `Nats-Msg-Id`, letting the stream drop producer
//! retries.

use std::time::Duration;

use async_nats::jetstream::consumer::{AckPolicy, pull};
use async_nats::jetstream::stream::{self, RetentionPolicy};
use async_nats::jetstream::{self, AckKind};
use futures::StreamExt as _;
use pixelwar_core::config::QueueConfig;
use pixelwar_core::error::StoreError;
use pixelwar_core::queue::{Delivery, UpdateQueue, UpdateSource, partition_for};
use pixelwar_types::{CellCoord, UpdateMessage};

use crate::error::BusError;

/// Stream configuration for `config`.
pub fn stream_config(config: &QueueConfig) -> stream::Config {
    stream::Config {
        name: config.stream.clone(),
        subjects: vec![format!("{}.*", config.subject_prefix)],
        retention: RetentionPolicy::WorkQueue,
        ..Default::default()
    }
}

/// Durable pull consumer configuration for `partition`.
pub fn consumer_config(config: &QueueConfig, partition: u32) -> pull::Config {
    pull::Config {
        durable_name: Some(config.durable_name(partition)),
        filter_subject: config.subject(partition),
        ack_policy: AckPolicy::Explicit,
        ack_wait: Duration::from_secs(config.ack_wait_secs),
        max_deliver: config.max_deliver,
        max_ack_pending: 1,
        ..Default::default()
    }
}

/// Producer side of the update queue.
#[derive(Clone)]
pub struct JetStreamQueue {
    context: jetstream::Context,
    config: QueueConfig,
}

impl JetStreamQueue {
    /// Bind to the stream described by `config`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::JetStream`] if the stream cannot be created.
    pub async fn new(context: jetstream::Context, config: QueueConfig) -> Result<Self, BusError> {
        context
            .get_or_create_stream(stream_config(&config))
            .await
            .map_err(|e| BusError::JetStream(format!("stream {}: {e}", config.stream)))?;
        tracing::info!(
            stream = %config.stream,
            partitions = config.partitions,
            "Update queue stream ready"
        );
        Ok(Self { context, config })
    }

    /// Publish `message` on the partition of `cell` and wait for the stream's
    /// acknowledgement, bounded by the enqueue timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if encoding, publishing or acknowledgement fails.
    pub async fn publish(&self, cell: CellCoord, message: &UpdateMessage) -> Result<(), BusError> {
        let partition = partition_for(cell, self.config.partitions);
        let subject = self.config.subject(partition);
        let payload = serde_json::to_vec(message)?;

        let mut headers = async_nats::HeaderMap::new();
        if let Some(id) = message.id {
            headers.insert("Nats-Msg-Id", id.to_string().as_str());
        }

        let timeout = self.config.enqueue_timeout();
        let publish = async move {
            let ack = self
                .context
                .publish_with_headers(subject.clone(), headers, payload.into())
                .await
                .map_err(|e| BusError::Publish(format!("{subject}: {e}")))?;
            ack.await
                .map_err(|e| BusError::Publish(format!("{subject} ack: {e}")))
        };
        tokio::time::timeout(timeout, publish)
            .await
            .map_err(|_elapsed| BusError::Timeout(timeout))??;

        tracing::debug!(partition, cell_x = cell.x, cell_y = cell.y, "Update enqueued");
        Ok(())
    }
}

impl UpdateQueue for JetStreamQueue {
    async fn enqueue(&self, cell: CellCoord, message: &UpdateMessage) -> Result<(), StoreError> {
        Ok(self.publish(cell, message).await?)
    }
}

/// Consumer of one partition.
pub struct JetStreamSource {
    partition: u32,
    messages: pull::Stream,
}

impl JetStreamSource {
    /// Attach to (or create) the durable consumer of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::JetStream`] if the stream or consumer is
    /// unavailable.
    pub async fn new(
        context: &jetstream::Context,
        config: &QueueConfig,
        partition: u32,
    ) -> Result<Self, BusError> {
        let stream = context
            .get_or_create_stream(stream_config(config))
            .await
            .map_err(|e| BusError::JetStream(format!("stream {}: {e}", config.stream)))?;
        let durable = config.durable_name(partition);
        let consumer = stream
            .get_or_create_consumer(&durable, consumer_config(config, partition))
            .await
            .map_err(|e| BusError::JetStream(format!("consumer {durable}: {e}")))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::JetStream(format!("consumer {durable} stream: {e}")))?;

        tracing::info!(partition, durable = %durable, "Partition consumer attached");
        Ok(Self {
            partition,
            messages,
        })
    }

    /// Partition this source consumes.
    pub const fn partition(&self) -> u32 {
        self.partition
    }
}

impl UpdateSource for JetStreamSource {
    type Delivery = JetStreamDelivery;

    async fn next_delivery(&mut self) -> Option<Result<JetStreamDelivery, StoreError>> {
        let next = self.messages.next().await?;
        Some(
            next.map(|message| JetStreamDelivery { message })
                .map_err(|e| StoreError::Unavailable(format!("partition {}: {e}", self.partition))),
        )
    }
}

/// A `JetStream` message awaiting acknowledgement.
pub struct JetStreamDelivery {
    message: jetstream::Message,
}

impl Delivery for JetStreamDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn attempt(&self) -> u64 {
        self.message
            .info()
            .ok()
            .and_then(|info| u64::try_from(info.delivered).ok())
            .unwrap_or(1)
    }

    async fn ack(self) -> Result<(), StoreError> {
        self.message
            .ack()
            .await
            .map_err(|e| StoreError::Unavailable(format!("ack: {e}")))
    }

    async fn retry(self, delay: Duration) -> Result<(), StoreError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| StoreError::Unavailable(format!("nak: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_covers_every_partition_subject() {
        let config = QueueConfig::default();
        let stream = stream_config(&config);
        assert_eq!(stream.name, "PIXEL_UPDATES");
        assert_eq!(stream.subjects, vec![String::from("pixel.updates.*")]);
        assert_eq!(stream.retention, RetentionPolicy::WorkQueue);
    }

    #[test]
    fn consumer_is_serial_and_filtered_to_its_partition() {
        let config = QueueConfig::default();
        let consumer = consumer_config(&config, 3);
        assert_eq!(consumer.durable_name.as_deref(), Some("pixel-worker-3"));
        assert_eq!(consumer.filter_subject, "pixel.updates.3");
        assert_eq!(consumer.max_ack_pending, 1);
        assert_eq!(consumer.ack_policy, AckPolicy::Explicit);
        assert_eq!(consumer.max_deliver, -1);
    }
}
