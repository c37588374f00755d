//! Error types for the NATS transport.

use std::time::Duration;

use pixelwar_core::error::StoreError;

/// Errors that can occur talking to NATS.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Could not connect to the server.
    #[error("NATS connection error: {0}")]
    Connect(String),

    /// A `JetStream` stream or consumer operation failed.
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Publishing a message failed.
    #[error("NATS publish error: {0}")]
    Publish(String),

    /// The broker did not acknowledge in time.
    #[error("NATS operation timed out after {0:?}")]
    Timeout(Duration),

    /// A payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BusError> for StoreError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout(after) => Self::Timeout(after),
            BusError::Serialization(e) => Self::Corrupt(e.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}
