//! Fast path: the synchronous part of a write.
//!
//! validate → cooldown → snap → lock cell → cache color + heatmap → enqueue
//! → release. The cell lock is held across the cache write and the enqueue so
//! two claims on one cell never interleave their cache and queue effects.
//!
//! A write that fails after the cache write puts the cell's previous cached
//! color back before the lock is released. The heatmap click stays counted.

use std::time::Duration;

use chrono::Utc;
use pixelwar_types::{CellCoord, CoordinatePair, MessageId, PaintRequest, UpdateMessage, UserId};
use validator::Validate as _;

use crate::cache::{FastPathCache, PixelCache};
use crate::config::PixelWarConfig;
use crate::cooldown::{CooldownDecision, CooldownGate, CooldownStore};
use crate::error::{PaintError, StoreError};
use crate::grid::GridQuantizer;
use crate::lock::{CellLease, CellLock, LockAcquisition, LockProvider};
use crate::queue::UpdateQueue;

/// A write accepted by the fast path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintReceipt {
    /// Claimed cell.
    pub cell: CellCoord,
    /// The cell's canonical coordinate.
    pub coordinate_pair: CoordinatePair,
    /// Id of the enqueued update.
    pub message_id: MessageId,
}

/// Write-path service.
#[derive(Debug, Clone)]
pub struct PaintService<Cd, L, C, Q> {
    cooldown: CooldownGate<Cd>,
    locks: CellLock<L>,
    cache: FastPathCache<C>,
    queue: Q,
    quantizer: GridQuantizer,
    wait_timeout: Duration,
    lease_timeout: Duration,
}

impl<Cd, L, C, Q> PaintService<Cd, L, C, Q>
where
    Cd: CooldownStore,
    L: LockProvider,
    C: PixelCache,
    Q: UpdateQueue,
{
    /// Compose the fast path from its collaborators.
    pub fn new(cooldown: Cd, locks: L, cache: C, queue: Q, config: &PixelWarConfig) -> Self {
        Self {
            cooldown: CooldownGate::new(cooldown, &config.cooldown),
            locks: CellLock::new(locks, &config.lock),
            cache: FastPathCache::new(cache, &config.heatmap, &config.api),
            queue,
            quantizer: GridQuantizer::new(&config.grid),
            wait_timeout: config.lock.wait_timeout(),
            lease_timeout: config.lock.lease_timeout(),
        }
    }

    /// The fast-path cache.
    pub const fn cache(&self) -> &FastPathCache<C> {
        &self.cache
    }

    /// The shared quantizer.
    pub const fn quantizer(&self) -> &GridQuantizer {
        &self.quantizer
    }

    /// Run one write through the fast path.
    ///
    /// A cooldown window consumed here is not refunded if the write later
    /// fails on contention or infrastructure.
    pub async fn paint(&self, request: &PaintRequest) -> Result<PaintReceipt, PaintError> {
        request
            .validate()
            .map_err(|e| PaintError::Validation(e.to_string()))?;
        let user = UserId::new(request.user_id.as_str());

        if let CooldownDecision::Rejected { remaining } = self.cooldown.try_accept(&user).await? {
            return Err(PaintError::RateLimited { remaining });
        }

        let (cell, snapped) = self.quantizer.snap(request.coordinate_pair);
        let lease = match self
            .locks
            .acquire(cell, self.wait_timeout, self.lease_timeout)
            .await?
        {
            LockAcquisition::Acquired(lease) => lease,
            LockAcquisition::Busy => return Err(PaintError::Contention { cell }),
        };

        let written = self.write_locked(cell, snapped, &request.color, &user).await;
        self.release(&lease).await;
        let message_id = written?;

        tracing::debug!(
            cell_x = cell.x,
            cell_y = cell.y,
            user_id = %user,
            message_id = %message_id,
            "Paint accepted"
        );
        Ok(PaintReceipt {
            cell,
            coordinate_pair: snapped,
            message_id,
        })
    }

    async fn write_locked(
        &self,
        cell: CellCoord,
        snapped: CoordinatePair,
        color: &str,
        user: &UserId,
    ) -> Result<MessageId, StoreError> {
        let previous = self.cache.cached_color(cell).await?;
        self.cache.set_color(cell, color).await?;

        let result = self.count_and_enqueue(cell, snapped, color, user).await;
        if let Err(e) = &result {
            self.roll_back(cell, previous.as_deref(), e).await;
        }
        result
    }

    async fn count_and_enqueue(
        &self,
        cell: CellCoord,
        snapped: CoordinatePair,
        color: &str,
        user: &UserId,
    ) -> Result<MessageId, StoreError> {
        let now = Utc::now();
        self.cache.increment_heatmap(cell, now).await?;

        let id = MessageId::new();
        let message = UpdateMessage {
            id: Some(id),
            coordinate_pair: snapped,
            color: color.to_owned(),
            user_id: user.clone(),
            enqueued_at: now,
        };
        self.queue.enqueue(cell, &message).await?;
        Ok(id)
    }

    async fn roll_back(&self, cell: CellCoord, previous: Option<&str>, cause: &StoreError) {
        tracing::warn!(
            cell_x = cell.x,
            cell_y = cell.y,
            error = %cause,
            "Write failed after cache update, restoring cell"
        );
        if let Err(e) = self.cache.restore_color(cell, previous).await {
            tracing::error!(
                cell_x = cell.x,
                cell_y = cell.y,
                error = %e,
                "Cache keeps an unpersisted color until rebuilt"
            );
        }
    }

    async fn release(&self, lease: &CellLease) {
        if lease.is_expired() {
            tracing::warn!(
                cell_x = lease.cell().x,
                cell_y = lease.cell().y,
                "Cell lease outlived by the write"
            );
        }
        if let Err(e) = self.locks.release(lease).await {
            // The lease expires on its own.
            tracing::warn!(cell_x = lease.cell().x, cell_y = lease.cell().y, error = %e, "Cell unlock failed");
        }
    }
}
