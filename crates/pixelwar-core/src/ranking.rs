//! Per-user count of currently owned cells.
//!
//! Scores move by exactly +1/-1 through atomic increments so concurrent
//! workers never lose updates. The durable cell records are the source of
//! truth; [`RankingLedger::reconcile`] recomputes every score from them.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use pixelwar_types::{RankEntry, UserId};

use crate::cells::CellStore;
use crate::config::RankingConfig;
use crate::error::StoreError;

/// Sorted-set store backing the ledger.
pub trait RankingStore: Send + Sync + 'static {
    /// Atomically add `delta` to `member`'s score in `key` and return the new
    /// score. Missing members start at zero.
    fn add_score(
        &self,
        key: &str,
        member: &str,
        delta: i64,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Score of `member`, if present.
    fn score(
        &self,
        key: &str,
        member: &str,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// The `limit` highest scores, highest first. Order among equal scores
    /// is up to the store.
    fn top_scores(
        &self,
        key: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(String, i64)>, StoreError>> + Send;

    /// Every member whose score equals `score`.
    fn members_with_score(
        &self,
        key: &str,
        score: i64,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Every member with its score.
    fn all_scores(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Vec<(String, i64)>, StoreError>> + Send;
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Users present in either the ledger or the durable store.
    pub users: usize,
    /// Users whose score had to be corrected.
    pub adjusted: usize,
    /// Users whose score moved during the pass, left for the next one.
    pub skipped: usize,
}

/// Leaderboard of owned-cell counts.
#[derive(Debug, Clone)]
pub struct RankingLedger<R> {
    store: R,
    key: String,
    default_top_k: usize,
    max_top_k: usize,
}

impl<R: RankingStore> RankingLedger<R> {
    /// Build a ledger over `store`.
    pub fn new(store: R, config: &RankingConfig) -> Self {
        Self {
            store,
            key: config.key.clone(),
            default_top_k: config.default_top_k,
            max_top_k: config.max_top_k,
        }
    }

    /// Add one owned cell to `user`. Returns the new score.
    pub async fn increment(&self, user: &UserId) -> Result<i64, StoreError> {
        self.store.add_score(&self.key, user.as_str(), 1).await
    }

    /// Remove one owned cell from `user`. Returns the new score.
    ///
    /// Not floored at zero: a negative score means the ledger drifted and
    /// reconciliation will repair it.
    pub async fn decrement(&self, user: &UserId) -> Result<i64, StoreError> {
        let score = self.store.add_score(&self.key, user.as_str(), -1).await?;
        if score < 0 {
            tracing::warn!(user_id = %user, score, "Ranking score went negative");
        }
        Ok(score)
    }

    /// Current score of `user` (zero when absent).
    pub async fn score(&self, user: &UserId) -> Result<i64, StoreError> {
        Ok(self
            .store
            .score(&self.key, user.as_str())
            .await?
            .unwrap_or(0))
    }

    /// Clamp a requested leaderboard size to the configured bounds.
    pub fn clamp_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_top_k)
            .clamp(1, self.max_top_k.max(1))
    }

    /// The `k` best users by score, ties broken by ascending user id.
    pub async fn top_k(&self, k: usize) -> Result<Vec<RankEntry>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut rows = self.store.top_scores(&self.key, k).await?;

        // The store may cut a tie group anywhere; fetch the whole group
        // sitting on the boundary and let the tie-break decide.
        if rows.len() == k
            && let Some(&(_, boundary)) = rows.last()
        {
            rows.retain(|(_, score)| *score > boundary);
            let tied = self.store.members_with_score(&self.key, boundary).await?;
            rows.extend(tied.into_iter().map(|member| (member, boundary)));
        }

        Ok(rank_entries(rows, k))
    }

    /// Recompute every score from the durable cell ownership and correct the
    /// ledger where it disagrees.
    ///
    /// The ledger is read before and after the ownership scan. A user whose
    /// score moved in between had a write land mid-pass and is skipped: the
    /// scan may or may not include that write. Corrections are applied as
    /// deltas, so increments racing with them are kept.
    ///
    /// A write whose durable record is already scanned but whose increment
    /// has not landed yet looks like drift. Callers running reconciliation
    /// next to consumers must hold those consumers off for the pass (see
    /// `PersistenceWorker::reconcile_now`).
    pub async fn reconcile<S: CellStore>(&self, cells: &S) -> Result<ReconcileReport, StoreError> {
        let before = self.score_map().await?;
        let expected: BTreeMap<String, i64> = cells
            .ownership_counts()
            .await?
            .into_iter()
            .map(|(user, count)| (user.0, count))
            .collect();
        let after = self.score_map().await?;

        let members: BTreeSet<&String> = before
            .keys()
            .chain(after.keys())
            .chain(expected.keys())
            .collect();

        let mut report = ReconcileReport::default();
        for member in members {
            report.users = report.users.saturating_add(1);
            let have = after.get(member).copied().unwrap_or(0);
            if before.get(member).copied().unwrap_or(0) != have {
                report.skipped = report.skipped.saturating_add(1);
                tracing::debug!(user_id = %member, "Score moved during reconciliation, skipped");
                continue;
            }
            let want = expected.get(member).copied().unwrap_or(0);
            if self.correct(member, have, want).await? {
                report.adjusted = report.adjusted.saturating_add(1);
            }
        }

        if report.adjusted > 0 {
            tracing::warn!(
                users = report.users,
                adjusted = report.adjusted,
                skipped = report.skipped,
                "Ranking ledger reconciled"
            );
        } else {
            tracing::debug!(
                users = report.users,
                skipped = report.skipped,
                "Ranking ledger consistent"
            );
        }
        Ok(report)
    }

    async fn score_map(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        Ok(self.store.all_scores(&self.key).await?.into_iter().collect())
    }

    async fn correct(&self, member: &str, have: i64, want: i64) -> Result<bool, StoreError> {
        let delta = want.saturating_sub(have);
        if delta == 0 {
            return Ok(false);
        }
        self.store.add_score(&self.key, member, delta).await?;
        tracing::info!(user_id = member, from = have, to = want, "Ranking score corrected");
        Ok(true)
    }
}

/// Order `rows` by score descending then user id ascending, keep the first
/// `k` and number them from 1.
pub fn rank_entries(mut rows: Vec<(String, i64)>, k: usize) -> Vec<RankEntry> {
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.dedup_by(|a, b| a.0 == b.0);
    rows.into_iter()
        .take(k)
        .zip(1_u32..)
        .map(|((member, score), rank)| RankEntry {
            rank,
            user_id: UserId(member),
            score,
        })
        .collect()
}
