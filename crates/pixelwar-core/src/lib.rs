//! Write-path contention pipeline for the Pixel War grid.
//!
//! A write passes the fast path synchronously (cooldown, cell lock, cache,
//! enqueue) and is persisted asynchronously by the durable path (persistence
//! worker, ranking ledger, broadcast). External collaborators sit behind
//! traits so the same pipeline runs on the in-memory backend in tests and on
//! Dragonfly, `PostgreSQL` and NATS in production.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `pixelwar-config.yaml`.
//! - [`error`] -- Error kinds, retry policies and per-layer error enums.
//! - [`grid`] -- [`GridQuantizer`]: raw coordinate to cell index and back.
//! - [`cooldown`] -- [`CooldownGate`]: atomic per-user rate limit.
//! - [`lock`] -- [`CellLock`]: leased per-cell mutual exclusion.
//! - [`cache`] -- [`FastPathCache`]: current colors and click heatmap.
//! - [`queue`] -- Partitioned at-least-once update queue traits.
//! - [`cells`] -- Versioned durable cell records.
//! - [`ranking`] -- [`RankingLedger`]: owned-cell leaderboard.
//! - [`broadcast`] -- Best-effort fan-out to live subscribers.
//! - [`paint`] -- [`PaintService`]: the fast path.
//! - [`worker`] -- [`PersistenceWorker`]: the durable path.
//! - [`backend`] -- Collaborator bundle of one deployment.
//! - [`memory`] -- In-process implementations of every collaborator.
//!
//! [`GridQuantizer`]: grid::GridQuantizer
//! [`CooldownGate`]: cooldown::CooldownGate
//! [`CellLock`]: lock::CellLock
//! [`FastPathCache`]: cache::FastPathCache
//! [`RankingLedger`]: ranking::RankingLedger
//! [`PaintService`]: paint::PaintService
//! [`PersistenceWorker`]: worker::PersistenceWorker

pub mod backend;
pub mod broadcast;
pub mod cache;
pub mod cells;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod grid;
pub mod lock;
pub mod memory;
pub mod paint;
pub mod queue;
pub mod ranking;
pub mod worker;
