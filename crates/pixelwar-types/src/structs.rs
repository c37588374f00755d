//! Grid entities and the payloads that travel between the write path, the
//! durable path and subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::{MessageId, UserId};

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

/// Integer address of one cell of the quantized grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub struct CellCoord {
    /// Cell index on the first axis.
    pub x: i64,
    /// Cell index on the second axis.
    pub y: i64,
}

impl CellCoord {
    /// Build a cell address from its two indices.
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Key fragment used by the stores (`{x}:{y}`).
    pub fn key(&self) -> String {
        format!("{}:{}", self.x, self.y)
    }

    /// Parse a `{x}:{y}` key fragment back into a cell address.
    pub fn parse_key(key: &str) -> Option<Self> {
        let (x, y) = key.split_once(':')?;
        Some(Self {
            x: x.parse().ok()?,
            y: y.parse().ok()?,
        })
    }
}

impl core::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A raw or snapped coordinate pair, serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CoordinatePair(pub f64, pub f64);

impl CoordinatePair {
    /// First axis value.
    pub const fn x(&self) -> f64 {
        self.0
    }

    /// Second axis value.
    pub const fn y(&self) -> f64 {
        self.1
    }

    /// Whether both values are finite numbers.
    pub const fn is_finite(&self) -> bool {
        self.0.is_finite() && self.1.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Durable cell
// ---------------------------------------------------------------------------

/// A claimed cell as recorded by the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Cell {
    /// Address of the cell.
    pub coord: CellCoord,
    /// Current color.
    pub color: String,
    /// Current owner.
    pub owner: UserId,
}

/// A cell as served to readers: snapped coordinate, color and owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct PixelView {
    /// Canonical corner coordinate of the cell.
    pub coordinate_pair: CoordinatePair,
    /// Current color.
    pub color: String,
    /// Current owner.
    pub user_id: UserId,
}

/// Color of a single cell (or the blank color when unclaimed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CellColor {
    /// Address of the cell.
    pub cell: CellCoord,
    /// Current color.
    pub color: String,
}

// ---------------------------------------------------------------------------
// Queue message
// ---------------------------------------------------------------------------

/// The unit carried by the update queue. Immutable once enqueued.
///
/// Wire shape: `{"id", "coordinatePair", "color", "userId", "timestamp"}`.
/// Unknown fields are ignored; `id` is optional so producers that predate it
/// still parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    /// Message identity, used to recognise redeliveries.
    #[serde(default)]
    pub id: Option<MessageId>,
    /// Snapped coordinate of the claimed cell.
    pub coordinate_pair: CoordinatePair,
    /// Requested color.
    pub color: String,
    /// Claiming user.
    pub user_id: UserId,
    /// When the write path enqueued the message.
    #[serde(rename = "timestamp")]
    pub enqueued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Leaderboard
// ---------------------------------------------------------------------------

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
    /// 1-based position.
    pub rank: u32,
    /// The ranked user.
    pub user_id: UserId,
    /// Net ownership-transfer score.
    pub score: i64,
}

// ---------------------------------------------------------------------------
// Live stream
// ---------------------------------------------------------------------------

/// Canonical post-write state pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct PixelBroadcast {
    /// Snapped coordinate of the cell.
    pub coordinate_pair: CoordinatePair,
    /// Address of the cell.
    pub cell: CellCoord,
    /// New color.
    pub color: String,
    /// Owner after the write.
    pub user_id: UserId,
    /// Owner before the write, when ownership changed hands.
    pub previous_owner: Option<UserId>,
    /// Enqueue time of the message that produced this state.
    pub timestamp: DateTime<Utc>,
}

/// A heavily clicked cell of the current heatmap window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct HotCell {
    /// Snapped coordinate of the cell.
    pub coordinate_pair: CoordinatePair,
    /// Address of the cell.
    pub cell: CellCoord,
    /// Clicks recorded in the window.
    pub clicks: u64,
}

// ---------------------------------------------------------------------------
// Write outcome
// ---------------------------------------------------------------------------

/// Synchronous reply of the write endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PaintOutcome {
    /// The write was accepted and enqueued.
    Ok,
    /// The user is still cooling down.
    Cooldown {
        /// Whole seconds until the user may write again (at least 1).
        #[serde(rename = "remainingSeconds")]
        remaining_seconds: u64,
    },
    /// Another write holds the cell.
    Busy,
    /// An infrastructure failure prevented the write.
    Failed,
}
