//! The set of collaborators one deployment wires together.

use crate::cache::PixelCache;
use crate::cells::CellStore;
use crate::cooldown::CooldownStore;
use crate::lock::LockProvider;
use crate::queue::UpdateQueue;
use crate::ranking::RankingStore;

/// Concrete collaborator types of a deployment.
///
/// Services are generic over a `Backend` so the same pipeline runs against
/// the in-memory stores in tests and against the networked stores in
/// production.
pub trait Backend: Send + Sync + 'static {
    /// Per-user cooldown store.
    type Cooldown: CooldownStore + Clone;
    /// Cell lock provider.
    type Locks: LockProvider + Clone;
    /// Fast-path color cache and heatmap.
    type Cache: PixelCache + Clone;
    /// Update queue producer.
    type Queue: UpdateQueue + Clone;
    /// Durable cell store.
    type Cells: CellStore + Clone;
    /// Ranking sorted-set store.
    type Ranking: RankingStore + Clone;
}
