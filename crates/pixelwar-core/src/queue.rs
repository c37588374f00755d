//! Durable, at-least-once update queue between the fast path and the
//! persistence workers.
//!
//! Messages are partitioned by cell so that every update of one cell is
//! consumed, in order, by one consumer.

use std::future::Future;
use std::time::Duration;

use pixelwar_types::{CellCoord, UpdateMessage};

use crate::error::StoreError;

/// Partition of `cell` among `partitions` partitions.
///
/// Stable across processes and releases: producers and consumers must agree
/// on it.
pub fn partition_for(cell: CellCoord, partitions: u32) -> u32 {
    let x = u64::from_ne_bytes(cell.x.to_ne_bytes());
    let y = u64::from_ne_bytes(cell.y.to_ne_bytes());
    let mut h = x.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ y.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= h.wrapping_shr(29);
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h.wrapping_shr(32);
    let bucket = h.checked_rem(u64::from(partitions.max(1))).unwrap_or(0);
    u32::try_from(bucket).unwrap_or(0)
}

/// Producer side of the queue.
pub trait UpdateQueue: Send + Sync + 'static {
    /// Durably enqueue `message` on the partition owning `cell`.
    ///
    /// Resolves only once the broker has accepted the message.
    fn enqueue(
        &self,
        cell: CellCoord,
        message: &UpdateMessage,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// One delivered message awaiting acknowledgement.
pub trait Delivery: Send + 'static {
    /// Raw message body.
    fn payload(&self) -> &[u8];

    /// How many times this message has been delivered, starting at 1.
    fn attempt(&self) -> u64;

    /// Acknowledge: the message will not be delivered again.
    fn ack(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Negative acknowledgement: the message will be delivered again, no
    /// sooner than `delay` from now, unless the delivery limit is reached.
    /// Later messages of the partition wait behind it.
    fn retry(self, delay: Duration) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Consumer side of one partition.
pub trait UpdateSource: Send + 'static {
    /// Delivery type of this source.
    type Delivery: Delivery;

    /// Next delivery, or `None` once the source is closed.
    fn next_delivery(
        &mut self,
    ) -> impl Future<Output = Option<Result<Self::Delivery, StoreError>>> + Send;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        let cell = CellCoord::new(125_000, 425_000);
        let p = partition_for(cell, 8);
        assert!(p < 8);
        assert_eq!(partition_for(cell, 8), p);
        assert_eq!(partition_for(cell, 1), 0);
        assert_eq!(partition_for(cell, 0), 0);
    }

    #[test]
    fn neighbouring_cells_spread_over_partitions() {
        let used: HashSet<u32> = (0..64)
            .map(|i| partition_for(CellCoord::new(i, -i), 8))
            .collect();
        assert!(used.len() > 4, "only {} partitions used", used.len());
    }
}
