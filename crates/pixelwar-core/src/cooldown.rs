//! Per-user rate limiting.
//!
//! The gate relies on one atomic "set if absent, with expiry" primitive of the
//! backing store. There is no read-then-write: two concurrent requests from
//! the same user race on the same key and exactly one of them creates it.

use std::future::Future;
use std::time::Duration;

use pixelwar_types::UserId;

use crate::config::CooldownConfig;
use crate::error::StoreError;

/// Result of an atomic set-if-absent-with-expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetIfAbsent {
    /// The key did not exist and now expires after the requested TTL.
    Created,
    /// The key already existed; it expires after `remaining`.
    Exists {
        /// Time-to-live left on the existing key.
        remaining: Duration,
    },
}

/// Key-value store with an atomic set-if-absent-with-expiry primitive.
pub trait CooldownStore: Send + Sync + 'static {
    /// Create `key` with the given TTL unless it already exists.
    ///
    /// Must be a single atomic operation on the store.
    fn set_if_absent(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<SetIfAbsent, StoreError>> + Send;
}

/// Decision of the cooldown gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    /// The user may write; a new window has started.
    Accepted,
    /// The user wrote too recently.
    Rejected {
        /// Time until the current window ends (always non-zero).
        remaining: Duration,
    },
}

/// Per-user cooldown gate.
#[derive(Debug, Clone)]
pub struct CooldownGate<S> {
    store: S,
    window: Duration,
}

impl<S: CooldownStore> CooldownGate<S> {
    /// Build a gate over `store` using the configured window.
    pub const fn new(store: S, config: &CooldownConfig) -> Self {
        Self {
            store,
            window: config.window(),
        }
    }

    /// Store key holding `user`'s cooldown marker.
    pub fn key(user: &UserId) -> String {
        format!("cooldown:{user}")
    }

    /// Accept the user and start a new window, or reject with the time left.
    ///
    /// The window starts at acceptance, not after the write completes, so
    /// overlapping requests from one user cannot both pass.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing store fails.
    pub async fn try_accept(&self, user: &UserId) -> Result<CooldownDecision, StoreError> {
        match self.store.set_if_absent(&Self::key(user), self.window).await? {
            SetIfAbsent::Created => Ok(CooldownDecision::Accepted),
            SetIfAbsent::Exists { remaining } => {
                // The key can expire between the failed set and the TTL read;
                // the caller still lost the race, so report a minimal wait.
                let remaining = remaining.max(Duration::from_millis(1));
                tracing::debug!(user_id = %user, remaining_ms = remaining.as_millis(), "Cooldown active");
                Ok(CooldownDecision::Rejected { remaining })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryKv;

    fn gate(secs: u64) -> CooldownGate<MemoryKv> {
        CooldownGate::new(MemoryKv::new(), &CooldownConfig { window_secs: secs })
    }

    #[tokio::test(start_paused = true)]
    async fn second_write_inside_window_is_rejected() {
        let gate = gate(5);
        let user = UserId::from("u1");

        assert_eq!(gate.try_accept(&user).await.unwrap(), CooldownDecision::Accepted);

        tokio::time::advance(Duration::from_secs(2)).await;
        match gate.try_accept(&user).await.unwrap() {
            CooldownDecision::Rejected { remaining } => {
                assert!(remaining > Duration::ZERO);
                assert!(remaining <= Duration::from_secs(3));
            }
            CooldownDecision::Accepted => panic!("second write inside the window was accepted"),
        }

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(gate.try_accept(&user).await.unwrap(), CooldownDecision::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn users_do_not_share_windows() {
        let gate = gate(5);
        assert_eq!(
            gate.try_accept(&UserId::from("a")).await.unwrap(),
            CooldownDecision::Accepted
        );
        assert_eq!(
            gate.try_accept(&UserId::from("b")).await.unwrap(),
            CooldownDecision::Accepted
        );
    }

    #[tokio::test]
    async fn concurrent_requests_from_one_user_admit_exactly_one() {
        let gate = Arc::new(gate(60));
        let user = UserId::from("racer");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let gate = Arc::clone(&gate);
            let user = user.clone();
            handles.push(tokio::spawn(async move { gate.try_accept(&user).await }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == CooldownDecision::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }
}
