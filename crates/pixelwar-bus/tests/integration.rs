//! Integration tests for the `pixelwar-bus` NATS transport.
//!
//! These tests require a live NATS server with `JetStream` enabled.
//! Run with:
//!
//! ```bash
//! docker compose up -d
//! cargo test -p pixelwar-bus -- --ignored
//! docker compose down
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::Utc;
use futures::StreamExt as _;
use pixelwar_bus::NatsBus;
use pixelwar_core::broadcast::Broadcaster as _;
use pixelwar_core::config::{BroadcastConfig, QueueConfig};
use pixelwar_core::queue::{Delivery as _, UpdateQueue as _, UpdateSource as _, partition_for};
use pixelwar_types::{CellCoord, CoordinatePair, MessageId, UpdateMessage, UserId};

const NATS_URL: &str = "nats://localhost:4222";

fn isolated_queue() -> QueueConfig {
    let tag = MessageId::new().to_string().replace('-', "");
    QueueConfig {
        stream: format!("TEST_{tag}"),
        subject_prefix: format!("test.{tag}"),
        partitions: 2,
        durable_prefix: format!("test-{tag}"),
        ..QueueConfig::default()
    }
}

#[tokio::test]
#[ignore = "requires live NATS server with JetStream (docker compose up -d)"]
async fn enqueued_message_reaches_its_partition_consumer() {
    let bus = NatsBus::connect(NATS_URL).await.expect("NATS not running?");
    let config = isolated_queue();
    let queue = bus.queue(&config).await.unwrap();

    let cell = CellCoord::new(125_000, 425_000);
    let message = UpdateMessage {
        id: Some(MessageId::new()),
        coordinate_pair: CoordinatePair(37.5, 127.5),
        color: String::from("#FF0000"),
        user_id: UserId::from("u1"),
        enqueued_at: Utc::now(),
    };
    queue.enqueue(cell, &message).await.unwrap();

    let mut source = bus
        .source(&config, partition_for(cell, config.partitions))
        .await
        .unwrap();
    let delivery = source.next_delivery().await.unwrap().unwrap();
    let received: UpdateMessage = serde_json::from_slice(delivery.payload()).unwrap();
    assert_eq!(received.id, message.id);
    delivery.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "requires live NATS server (docker compose up -d)"]
async fn broadcasts_reach_subscribers() {
    let bus = NatsBus::connect(NATS_URL).await.expect("NATS not running?");
    let config = BroadcastConfig {
        subject_prefix: format!("test.broadcast.{}", MessageId::new()),
        ..BroadcastConfig::default()
    };
    let mut subscriber = bus.subscribe_broadcasts(&config, "pixels").await.unwrap();
    bus.flush().await.unwrap();

    bus.broadcaster(&config)
        .publish("pixels", b"{}".to_vec())
        .await
        .unwrap();

    let received = subscriber.next().await.unwrap();
    assert_eq!(received.payload.as_ref(), b"{}");
}
