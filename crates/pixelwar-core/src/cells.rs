//! Durable cell records.

use std::future::Future;

use chrono::{DateTime, Utc};
use pixelwar_types::{Cell, CellCoord, MessageId, UserId};

use crate::error::StoreError;

/// Durable state of one claimed cell.
///
/// `version` increments on every applied write and backs the optimistic
/// concurrency check of [`CellStore::update_if_version`]. `last_message_id`
/// and `last_enqueued_at` identify the last applied update so replays and
/// out-of-order deliveries can be recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRecord {
    /// Cell index.
    pub coord: CellCoord,
    /// Current color.
    pub color: String,
    /// Current owner.
    pub owner: UserId,
    /// Write counter, starting at 1.
    pub version: i64,
    /// Id of the last applied update, if it carried one.
    pub last_message_id: Option<MessageId>,
    /// Enqueue time of the last applied update.
    pub last_enqueued_at: DateTime<Utc>,
}

impl CellRecord {
    /// First record of a cell claimed by `cell.owner`.
    pub fn claim(cell: &Cell, message_id: Option<MessageId>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            coord: cell.coord,
            color: cell.color.clone(),
            owner: cell.owner.clone(),
            version: 1,
            last_message_id: message_id,
            last_enqueued_at: enqueued_at,
        }
    }

    /// The public view of this record.
    pub fn to_cell(&self) -> Cell {
        Cell {
            coord: self.coord,
            color: self.color.clone(),
            owner: self.owner.clone(),
        }
    }
}

/// A write replacing a cell's color and owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellWrite {
    /// New color.
    pub color: String,
    /// New owner.
    pub owner: UserId,
    /// Id of the update being applied.
    pub message_id: Option<MessageId>,
    /// Enqueue time of the update being applied.
    pub enqueued_at: DateTime<Utc>,
}

/// Durable cell storage.
pub trait CellStore: Send + Sync + 'static {
    /// Record of `cell`, if it was ever claimed.
    fn find(
        &self,
        cell: CellCoord,
    ) -> impl Future<Output = Result<Option<CellRecord>, StoreError>> + Send;

    /// Insert `record` unless a record for the same cell exists. Returns
    /// whether the insert happened.
    fn insert_if_absent(
        &self,
        record: &CellRecord,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Apply `write` to `cell` only if its version is still
    /// `expected_version`, bumping the version. Returns whether the write
    /// happened.
    fn update_if_version(
        &self,
        cell: CellCoord,
        expected_version: i64,
        write: &CellWrite,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Cells with `min.x <= x <= max.x` and `min.y <= y <= max.y`, at most
    /// `limit` of them.
    fn find_in_bounds(
        &self,
        min: CellCoord,
        max: CellCoord,
        limit: u64,
    ) -> impl Future<Output = Result<Vec<Cell>, StoreError>> + Send;

    /// Every claimed cell.
    fn all(&self) -> impl Future<Output = Result<Vec<Cell>, StoreError>> + Send;

    /// Number of cells owned per user, users with no cell omitted.
    fn ownership_counts(
        &self,
    ) -> impl Future<Output = Result<Vec<(UserId, i64)>, StoreError>> + Send;
}
