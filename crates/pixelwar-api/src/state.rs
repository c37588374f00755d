//! Shared application state for the API server.
//!
//! [`AppState`] owns the fast path ([`PaintService`]), the read side of the
//! durable store and ranking ledger, and the local broadcast hub that
//! `WebSocket` clients subscribe to. It is generic over a [`Backend`] so the
//! same handlers serve the in-memory stores in tests and the networked
//! stores in production.

use pixelwar_core::backend::Backend;
use pixelwar_core::broadcast::{ChannelMessage, LocalBroadcaster};
use pixelwar_core::config::PixelWarConfig;
use pixelwar_core::grid::GridQuantizer;
use pixelwar_core::memory::MemoryBackend;
use pixelwar_core::paint::PaintService;
use pixelwar_core::ranking::RankingLedger;
use tokio::sync::broadcast;

/// The fast path over a backend's collaborators.
pub type BackendPaintService<B> = PaintService<
    <B as Backend>::Cooldown,
    <B as Backend>::Locks,
    <B as Backend>::Cache,
    <B as Backend>::Queue,
>;

/// One instance of every collaborator of a backend.
pub struct Collaborators<B: Backend> {
    /// Per-user cooldown store.
    pub cooldown: B::Cooldown,
    /// Cell lock provider.
    pub locks: B::Locks,
    /// Color cache and heatmap.
    pub cache: B::Cache,
    /// Update queue producer.
    pub queue: B::Queue,
    /// Durable cell store.
    pub cells: B::Cells,
    /// Ranking sorted-set store.
    pub ranking: B::Ranking,
}

impl From<&MemoryBackend> for Collaborators<MemoryBackend> {
    fn from(backend: &MemoryBackend) -> Self {
        Self {
            cooldown: backend.kv.clone(),
            locks: backend.kv.clone(),
            cache: backend.kv.clone(),
            queue: backend.queue.clone(),
            cells: backend.cells.clone(),
            ranking: backend.kv.clone(),
        }
    }
}

/// Shared state handed to every handler.
pub struct AppState<B: Backend> {
    /// The write path.
    pub paint: BackendPaintService<B>,
    /// Durable cell records (read side).
    pub cells: B::Cells,
    /// Leaderboard.
    pub ranking: RankingLedger<B::Ranking>,
    /// Fan-out hub feeding `WebSocket` clients.
    pub broadcaster: LocalBroadcaster,
    /// Configuration the state was built from.
    pub config: PixelWarConfig,
}

impl<B: Backend> AppState<B> {
    /// Build the state from a backend's collaborators.
    pub fn new(parts: Collaborators<B>, config: PixelWarConfig) -> Self {
        let paint = PaintService::new(
            parts.cooldown,
            parts.locks,
            parts.cache,
            parts.queue,
            &config,
        );
        Self {
            paint,
            cells: parts.cells,
            ranking: RankingLedger::new(parts.ranking, &config.ranking),
            broadcaster: LocalBroadcaster::new(config.broadcast.local_capacity),
            config,
        }
    }

    /// The shared quantizer.
    pub const fn quantizer(&self) -> &GridQuantizer {
        self.paint.quantizer()
    }

    /// Subscribe to every message relayed to this instance.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.broadcaster.subscribe()
    }
}

impl AppState<MemoryBackend> {
    /// State over a fresh in-memory backend, for tests and local runs.
    pub fn in_memory(config: PixelWarConfig) -> (Self, MemoryBackend) {
        let backend = MemoryBackend::new(config.queue.partitions);
        (Self::new(Collaborators::from(&backend), config), backend)
    }
}
