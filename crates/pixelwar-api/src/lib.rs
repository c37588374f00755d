//! HTTP + `WebSocket` surface of the Pixel War grid.
//!
//! Writers claim cells through `POST /api/pixels`, which runs the fast path
//! synchronously. Readers query colors, regions, the heatmap and the
//! leaderboard over REST and follow applied updates on `GET /ws/pixels`.
//!
//! # Architecture
//!
//! ```text
//! Client --HTTP--> Router --> handlers --> PaintService --> Dragonfly + queue
//!                                     \--> CellStore / RankingLedger (reads)
//! Worker --NATS--> relay --> LocalBroadcaster --> ws handlers --> Client
//! ```
//!
//! # Modules
//!
//! - [`state`] -- Shared application state generic over a backend
//! - [`handlers`] -- REST endpoint handlers
//! - [`ws`] -- `WebSocket` live stream
//! - [`router`] -- Route table and middleware
//! - [`server`] -- Listener lifecycle
//! - [`relay`] -- Transport to local fan-out relay
//! - [`live`] -- Production backend wiring
//! - [`error`] -- Error types with HTTP status mapping

pub mod error;
pub mod handlers;
pub mod live;
pub mod relay;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use live::LiveBackend;
pub use router::build_router;
pub use server::{ServerConfig, start_server};
pub use state::{AppState, Collaborators};
