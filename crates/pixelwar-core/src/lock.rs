//! Leased, distributed mutual exclusion keyed by cell.
//!
//! A lease is a store key holding a random token with a TTL. Acquisition is
//! an atomic set-if-absent; release deletes the key only if it still holds
//! the caller's token, so a holder whose lease already expired cannot release
//! somebody else's lock. A crashed or stalled holder blocks the cell for at
//! most one lease.

use std::future::Future;
use std::time::Duration;

use pixelwar_types::CellCoord;
use rand::Rng as _;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::StoreError;

/// Backing store of [`CellLock`].
pub trait LockProvider: Send + Sync + 'static {
    /// Atomically create `key` holding `token` with the given lease, unless it
    /// already exists. Returns whether the key was created.
    fn try_lock(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Atomically delete `key` if it still holds `token`. Returns whether a
    /// key was deleted.
    fn unlock(
        &self,
        key: &str,
        token: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// A granted lease on one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellLease {
    key: String,
    token: String,
    cell: CellCoord,
    acquired_at: Instant,
    lease: Duration,
}

impl CellLease {
    /// The locked cell.
    pub const fn cell(&self) -> CellCoord {
        self.cell
    }

    /// Whether the lease has outlived its timeout (by local clock).
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

/// Outcome of [`CellLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The lock was granted.
    Acquired(CellLease),
    /// The wait timeout elapsed without acquiring.
    Busy,
}

/// Per-cell leased lock.
#[derive(Debug, Clone)]
pub struct CellLock<P> {
    provider: P,
    retry_interval: Duration,
}

impl<P: LockProvider> CellLock<P> {
    /// Build a lock over `provider`.
    pub const fn new(provider: P, config: &LockConfig) -> Self {
        Self {
            provider,
            retry_interval: config.retry_interval(),
        }
    }

    /// Store key of `cell`'s lock.
    pub fn key(cell: CellCoord) -> String {
        format!("pixel:lock:{}", cell.key())
    }

    /// Try to lock `cell` for `lease`, polling for up to `wait`.
    ///
    /// Returns [`LockAcquisition::Busy`] once `wait` has elapsed without a
    /// grant; the caller is expected to fail fast rather than queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lock provider fails.
    pub async fn acquire(
        &self,
        cell: CellCoord,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockAcquisition, StoreError> {
        let key = Self::key(cell);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started.checked_add(wait).unwrap_or(started);

        loop {
            let now = Instant::now();
            if self.provider.try_lock(&key, &token, lease).await? {
                return Ok(LockAcquisition::Acquired(CellLease {
                    key,
                    token,
                    cell,
                    acquired_at: now,
                    lease,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(cell_x = cell.x, cell_y = cell.y, "Cell lock busy");
                return Ok(LockAcquisition::Busy);
            }
            let pause = self
                .jittered_interval()
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(pause).await;
        }
    }

    /// Release `lease`. Idempotent: releasing twice, or after the lease
    /// expired and someone else took the cell, has no effect.
    ///
    /// Returns whether this call removed the caller's lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lock provider fails.
    pub async fn release(&self, lease: &CellLease) -> Result<bool, StoreError> {
        let released = self.provider.unlock(&lease.key, &lease.token).await?;
        if !released {
            tracing::warn!(
                cell_x = lease.cell.x,
                cell_y = lease.cell.y,
                "Cell lease expired before release"
            );
        }
        Ok(released)
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.retry_interval.max(Duration::from_millis(1));
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        base.mul_f64(factor)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::MemoryKv;

    fn lock() -> CellLock<MemoryKv> {
        CellLock::new(MemoryKv::new(), &LockConfig::default())
    }

    fn lease_of(acq: LockAcquisition) -> CellLease {
        match acq {
            LockAcquisition::Acquired(lease) => lease,
            LockAcquisition::Busy => panic!("expected the lock to be granted"),
        }
    }

    #[tokio::test]
    async fn second_acquire_is_busy_until_release() {
        let lock = lock();
        let cell = CellCoord::new(4, 2);
        let first = lease_of(
            lock.acquire(cell, Duration::ZERO, Duration::from_secs(2))
                .await
                .unwrap(),
        );

        let second = lock
            .acquire(cell, Duration::from_millis(30), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(second, LockAcquisition::Busy);

        assert!(lock.release(&first).await.unwrap());
        let third = lock
            .acquire(cell, Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(third, LockAcquisition::Acquired(_)));
    }

    #[tokio::test]
    async fn other_cells_are_independent() {
        let lock = lock();
        let a = lock
            .acquire(CellCoord::new(0, 0), Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap();
        let b = lock
            .acquire(CellCoord::new(0, 1), Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(a, LockAcquisition::Acquired(_)));
        assert!(matches!(b, LockAcquisition::Acquired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_when_holder_never_releases() {
        let lock = lock();
        let cell = CellCoord::new(9, 9);
        let stale = lease_of(
            lock.acquire(cell, Duration::ZERO, Duration::from_millis(500))
                .await
                .unwrap(),
        );

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(stale.is_expired());
        let fresh = lease_of(
            lock.acquire(cell, Duration::ZERO, Duration::from_secs(2))
                .await
                .unwrap(),
        );

        // The stale holder cannot release the new holder's lock.
        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.release(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let lock = lock();
        let lease = lease_of(
            lock.acquire(CellCoord::new(1, 1), Duration::ZERO, Duration::from_secs(2))
                .await
                .unwrap(),
        );
        assert!(lock.release(&lease).await.unwrap());
        assert!(!lock.release(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn waiter_acquires_once_holder_releases() {
        let lock = Arc::new(lock());
        let cell = CellCoord::new(3, 3);
        let held = lease_of(
            lock.acquire(cell, Duration::ZERO, Duration::from_secs(5))
                .await
                .unwrap(),
        );

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                lock.acquire(cell, Duration::from_secs(2), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.release(&held).await.unwrap();

        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn at_most_one_holder_at_a_time() {
        let lock = Arc::new(lock());
        let cell = CellCoord::new(7, 7);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let acq = lock
                    .acquire(cell, Duration::from_secs(5), Duration::from_secs(5))
                    .await
                    .unwrap();
                if let LockAcquisition::Acquired(lease) = acq {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.release(&lease).await.unwrap();
                    true
                } else {
                    false
                }
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 16);
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
