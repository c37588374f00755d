//! Shared type definitions for the Pixel War grid.
//!
//! Every crate in the workspace (write path, durable path, HTTP surface)
//! speaks these types. Types flow downstream to `TypeScript` via `ts-rs` for
//! the map client.
//!
//! # Modules
//!
//! - [`ids`] -- User and message identifiers
//! - [`structs`] -- Cells, queue messages, leaderboard rows, broadcasts
//! - [`requests`] -- The validated write request

pub mod ids;
pub mod requests;
pub mod structs;

pub use ids::{MessageId, UserId};
pub use requests::PaintRequest;
pub use structs::{
    Cell, CellColor, CellCoord, CoordinatePair, HotCell, PaintOutcome, PixelBroadcast, PixelView,
    RankEntry, UpdateMessage,
};
