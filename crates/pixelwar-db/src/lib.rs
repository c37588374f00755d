//! Data layer for the Pixel War grid (`Dragonfly` + `PostgreSQL`).
//!
//! `Dragonfly` holds everything the fast path touches: cooldown markers, cell
//! locks, the color cache, heatmap buckets and the ranking sorted set.
//! `PostgreSQL` holds the durable cell records written by the persistence
//! workers.
//!
//! ```text
//! Fast path ---------> Dragonfly (DragonflyPool)
//!                        cooldown:{user}  pixel:lock:{x}:{y}
//!                        pixel:{x}:{y}    heatmap:{window}
//!                        ranking sorted set
//!
//! Persistence worker -> PostgreSQL (PgCellStore, table `pixels`)
//!                   \--> Dragonfly ranking sorted set
//! ```
//!
//! # Modules
//!
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) stores
//! - [`postgres`] -- `PostgreSQL` pool sized from the infrastructure config
//! - [`cell_store`] -- Versioned durable cell records
//! - [`error`] -- Shared error types

pub mod cell_store;
pub mod dragonfly;
pub mod error;
pub mod postgres;

pub use cell_store::PgCellStore;
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use postgres::{PoolSettings, PostgresPool};
