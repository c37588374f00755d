//! NATS transport for the Pixel War grid.
//!
//! The durable update queue is a `JetStream` work-queue stream with one
//! subject per cell partition and one durable pull consumer per partition.
//! Live broadcasts use core NATS pub/sub and are not persisted.
//!
//! # Modules
//!
//! - [`client`] -- Connection wrapper and factory for queues and broadcasters
//! - [`queue`] -- `JetStream` producer, partition consumer and deliveries
//! - [`broadcast`] -- Core NATS broadcaster
//! - [`error`] -- Shared error types

pub mod broadcast;
pub mod client;
pub mod error;
pub mod queue;

pub use broadcast::NatsBroadcaster;
pub use client::NatsBus;
pub use error::BusError;
pub use queue::{JetStreamDelivery, JetStreamQueue, JetStreamSource};
