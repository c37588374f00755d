//! Production backend: `Dragonfly` for the fast-path stores and the ranking
//! set, NATS `JetStream` for the update queue, `PostgreSQL` for durable cells.

use pixelwar_bus::JetStreamQueue;
use pixelwar_core::backend::Backend;
use pixelwar_db::{DragonflyPool, PgCellStore};

use crate::state::Collaborators;

/// Networked deployment.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveBackend;

impl Backend for LiveBackend {
    type Cooldown = DragonflyPool;
    type Locks = DragonflyPool;
    type Cache = DragonflyPool;
    type Queue = JetStreamQueue;
    type Cells = PgCellStore;
    type Ranking = DragonflyPool;
}

impl Collaborators<LiveBackend> {
    /// Share one `Dragonfly` connection across every key-value role.
    pub fn live(dragonfly: &DragonflyPool, queue: JetStreamQueue, cells: PgCellStore) -> Self {
        Self {
            cooldown: dragonfly.clone(),
            locks: dragonfly.clone(),
            cache: dragonfly.clone(),
            queue,
            cells,
            ranking: dragonfly.clone(),
        }
    }
}
