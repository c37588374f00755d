//! `Dragonfly` (Redis-compatible) stores for the fast path and the ledger.
//!
//! Every primitive that must be atomic is a single command or a Lua script,
//! never a read followed by a write.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `cooldown:{user}` | String + TTL | Cooldown marker |
//! | `pixel:lock:{x}:{y}` | String + TTL | Cell lease holding the owner token |
//! | `pixel:{x}:{y}` | String | Cached cell color |
//! | `heatmap:{window}` | Sorted set + TTL | Clicks per cell key in one window |
//! | `pixel-war:ranking` | Sorted set | Owned-cell count per user |

use std::time::Duration;

use fred::prelude::*;
use pixelwar_core::cache::PixelCache;
use pixelwar_core::cooldown::{CooldownStore, SetIfAbsent};
use pixelwar_core::error::StoreError;
use pixelwar_core::lock::LockProvider;
use pixelwar_core::ranking::RankingStore;

use crate::error::DbError;

/// Create `KEYS[1]` with a TTL of `ARGV[1]` ms unless it exists; otherwise
/// report its remaining TTL.
const SET_IF_ABSENT_SCRIPT: &str = r"
if redis.call('SET', KEYS[1], '1', 'NX', 'PX', ARGV[1]) then
  return {1, 0}
end
return {0, redis.call('PTTL', KEYS[1])}
";

/// Delete `KEYS[1]` only if it still holds the token `ARGV[1]`.
const UNLOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Count one click on `ARGV[1]` and re-arm the bucket expiry (`ARGV[2]` s).
const HEATMAP_SCRIPT: &str = r"
redis.call('ZINCRBY', KEYS[1], 1, ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
";

/// Atomically add `ARGV[2]` to member `ARGV[1]` and return the integer score.
const ADD_SCORE_SCRIPT: &str = r"
return tonumber(redis.call('ZINCRBY', KEYS[1], ARGV[2], ARGV[1]))
";

/// Members of `KEYS[1]` scoring exactly `ARGV[1]`.
const MEMBERS_AT_SCRIPT: &str = r"
return redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1])
";

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
///
/// Wraps a [`fred::prelude::Client`]. Implements the cooldown, lock, cache
/// and ranking store traits of `pixelwar-core`.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    // =========================================================================
    // Expiring keys -- cooldown:{user}, pixel:lock:{x}:{y}
    // =========================================================================

    /// Create `key` expiring after `ttl` unless it exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the script fails or replies unexpectedly.
    pub async fn set_nx_px(&self, key: &str, ttl: Duration) -> Result<SetIfAbsent, DbError> {
        let reply: Vec<i64> = self
            .client
            .eval(SET_IF_ABSENT_SCRIPT, vec![key], vec![millis(ttl).to_string()])
            .await?;
        match reply.as_slice() {
            [1, _] => Ok(SetIfAbsent::Created),
            [0, pttl] => Ok(SetIfAbsent::Exists {
                remaining: Duration::from_millis(u64::try_from(*pttl).unwrap_or(0)),
            }),
            other => Err(DbError::Corrupt(format!("unexpected SET NX reply {other:?}"))),
        }
    }

    /// Create `key` holding `token` for `lease` unless it exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn lock_key(&self, key: &str, token: &str, lease: Duration) -> Result<bool, DbError> {
        let reply: Option<String> = self
            .client
            .set(
                key,
                token,
                Some(Expiration::PX(millis(lease))),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(reply.is_some())
    }

    /// Delete `key` if it still holds `token`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the script fails.
    pub async fn unlock_key(&self, key: &str, token: &str) -> Result<bool, DbError> {
        let deleted: i64 = self
            .client
            .eval(UNLOCK_SCRIPT, vec![key], vec![token.to_owned()])
            .await?;
        Ok(deleted > 0)
    }

    // =========================================================================
    // Cell colors -- pixel:{x}:{y}
    // =========================================================================

    /// Store `value` at `key` without expiry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn set_string(&self, key: &str, value: &str) -> Result<(), DbError> {
        let _: () = self.client.set(key, value, None, None, false).await?;
        Ok(())
    }

    /// Read the string at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the read fails.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, DbError> {
        Ok(self.client.get(key).await?)
    }

    /// Delete `key` if present.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), DbError> {
        let _: i64 = self.client.del(key).await?;
        Ok(())
    }

    // =========================================================================
    // Sorted sets -- heatmap:{window}, ranking
    // =========================================================================

    /// Count one click on `member` in `key` and reset the bucket expiry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the script fails.
    pub async fn bump_heatmap(&self, key: &str, member: &str, ttl: Duration) -> Result<(), DbError> {
        let secs = ttl.as_secs().max(1);
        let _: i64 = self
            .client
            .eval(
                HEATMAP_SCRIPT,
                vec![key],
                vec![member.to_owned(), secs.to_string()],
            )
            .await?;
        Ok(())
    }

    /// Atomically add `delta` to `member` and return the new score.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the script fails.
    pub async fn zset_add(&self, key: &str, member: &str, delta: i64) -> Result<i64, DbError> {
        Ok(self
            .client
            .eval(
                ADD_SCORE_SCRIPT,
                vec![key],
                vec![member.to_owned(), delta.to_string()],
            )
            .await?)
    }

    /// Score of `member` in `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails or the score is not a number.
    pub async fn zset_score(&self, key: &str, member: &str) -> Result<Option<i64>, DbError> {
        let raw: Option<String> = self.client.zscore(key, member).await?;
        raw.as_deref().map(parse_score).transpose()
    }

    /// The `limit` highest-scored members of `key`, highest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails or a score is not a number.
    pub async fn zset_top(&self, key: &str, limit: usize) -> Result<Vec<(String, i64)>, DbError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit).unwrap_or(i64::MAX).saturating_sub(1);
        let flat: Vec<String> = self
            .client
            .zrange(key, 0_i64, stop, None, true, None, true)
            .await?;
        pairs(flat)
    }

    /// Every member of `key` with its score, lowest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails or a score is not a number.
    pub async fn zset_all(&self, key: &str) -> Result<Vec<(String, i64)>, DbError> {
        let flat: Vec<String> = self
            .client
            .zrange(key, 0_i64, -1_i64, None, false, None, true)
            .await?;
        pairs(flat)
    }

    /// Members of `key` whose score is exactly `score`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the script fails.
    pub async fn zset_members_at(&self, key: &str, score: i64) -> Result<Vec<String>, DbError> {
        Ok(self
            .client
            .eval(MEMBERS_AT_SCRIPT, vec![key], vec![score.to_string()])
            .await?)
    }

    /// Flush all keys from the `Dragonfly` instance.
    ///
    /// **WARNING:** This deletes all data. Only use for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the flush fails.
    pub async fn flush_all(&self) -> Result<(), DbError> {
        let _: () = self.client.flushall(false).await?;
        Ok(())
    }

    /// Return a reference to the underlying [`Client`].
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

impl CooldownStore for DragonflyPool {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<SetIfAbsent, StoreError> {
        Ok(self.set_nx_px(key, ttl).await?)
    }
}

impl LockProvider for DragonflyPool {
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        Ok(self.lock_key(key, token, lease).await?)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        Ok(self.unlock_key(key, token).await?)
    }
}

impl PixelCache for DragonflyPool {
    async fn set_color(&self, key: &str, color: &str) -> Result<(), StoreError> {
        Ok(self.set_string(key, color).await?)
    }

    async fn get_color(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_string(key).await?)
    }

    async fn clear_color(&self, key: &str) -> Result<(), StoreError> {
        Ok(self.delete(key).await?)
    }

    async fn increment_heatmap(
        &self,
        window_key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        Ok(self.bump_heatmap(window_key, member, ttl).await?)
    }

    async fn hot_members(
        &self,
        window_key: &str,
        limit: usize,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let rows = self.zset_top(window_key, limit).await?;
        Ok(rows
            .into_iter()
            .map(|(member, clicks)| (member, u64::try_from(clicks).unwrap_or(0)))
            .collect())
    }
}

impl RankingStore for DragonflyPool {
    async fn add_score(&self, key: &str, member: &str, delta: i64) -> Result<i64, StoreError> {
        Ok(self.zset_add(key, member, delta).await?)
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.zset_score(key, member).await?)
    }

    async fn top_scores(&self, key: &str, limit: usize) -> Result<Vec<(String, i64)>, StoreError> {
        Ok(self.zset_top(key, limit).await?)
    }

    async fn members_with_score(&self, key: &str, score: i64) -> Result<Vec<String>, StoreError> {
        Ok(self.zset_members_at(key, score).await?)
    }

    async fn all_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        Ok(self.zset_all(key).await?)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Parse a sorted-set score. Scores written by this crate are integral.
#[allow(clippy::cast_possible_truncation)]
fn parse_score(raw: &str) -> Result<i64, DbError> {
    if let Ok(whole) = raw.parse::<i64>() {
        return Ok(whole);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value.round() as i64),
        _ => Err(DbError::Corrupt(format!("score {raw:?} is not a number"))),
    }
}

/// Split a flat `[member, score, member, score, ...]` reply.
fn pairs(flat: Vec<String>) -> Result<Vec<(String, i64)>, DbError> {
    let mut rows = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let Some(member) = iter.next() {
        let Some(score) = iter.next() else {
            return Err(DbError::Corrupt(format!("member {member:?} without score")));
        };
        rows.push((member, parse_score(&score)?));
    }
    Ok(rows)
}
