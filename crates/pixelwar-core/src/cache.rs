//! Low-latency current color per cell plus the click heatmap.
//!
//! The cache is written before the durable write happens, so it may briefly
//! disagree with the durable store. Readers fall back to the durable store on
//! a miss, and [`FastPathCache::rebuild_from`] replays every durable cell.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pixelwar_types::{CellCoord, HotCell};

use crate::cells::CellStore;
use crate::config::{ApiConfig, HeatmapConfig};
use crate::error::StoreError;
use crate::grid::GridQuantizer;

/// Backing key-value store of the fast-path cache.
pub trait PixelCache: Send + Sync + 'static {
    /// Set `key` to `color`, no expiry.
    fn set_color(
        &self,
        key: &str,
        color: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Current value of `key`, if any.
    fn get_color(&self, key: &str)
    -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Remove `key`. Missing keys are not an error.
    fn clear_color(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Add one to `member` in the sorted set `window_key` and (re)arm the
    /// set's expiry to `ttl`.
    fn increment_heatmap(
        &self,
        window_key: &str,
        member: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// The `limit` highest-scored members of `window_key`, highest first.
    fn hot_members(
        &self,
        window_key: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(String, u64)>, StoreError>> + Send;
}

/// Fast-path cell color cache.
#[derive(Debug, Clone)]
pub struct FastPathCache<C> {
    store: C,
    heatmap: HeatmapConfig,
    blank_color: String,
}

impl<C: PixelCache> FastPathCache<C> {
    /// Build a cache over `store`.
    pub fn new(store: C, heatmap: &HeatmapConfig, api: &ApiConfig) -> Self {
        Self {
            store,
            heatmap: *heatmap,
            blank_color: api.blank_color.clone(),
        }
    }

    /// Store key of `cell`'s color.
    pub fn key(cell: CellCoord) -> String {
        format!("pixel:{}", cell.key())
    }

    /// Color reported for cells nobody has painted.
    pub fn blank_color(&self) -> &str {
        &self.blank_color
    }

    /// Record `color` as the current color of `cell`.
    pub async fn set_color(&self, cell: CellCoord, color: &str) -> Result<(), StoreError> {
        self.store.set_color(&Self::key(cell), color).await
    }

    /// Put back a color read earlier with [`FastPathCache::cached_color`]:
    /// `None` removes the entry.
    pub async fn restore_color(
        &self,
        cell: CellCoord,
        previous: Option<&str>,
    ) -> Result<(), StoreError> {
        match previous {
            Some(color) => self.set_color(cell, color).await,
            None => self.store.clear_color(&Self::key(cell)).await,
        }
    }

    /// Cached color of `cell`, or `None` on a miss.
    pub async fn cached_color(&self, cell: CellCoord) -> Result<Option<String>, StoreError> {
        self.store.get_color(&Self::key(cell)).await
    }

    /// Cached color of `cell`, or the blank color on a miss.
    pub async fn get_color(&self, cell: CellCoord) -> Result<String, StoreError> {
        Ok(self
            .cached_color(cell)
            .await?
            .unwrap_or_else(|| self.blank_color.clone()))
    }

    /// Count one click on `cell` in the heatmap window containing `at`.
    pub async fn increment_heatmap(
        &self,
        cell: CellCoord,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let window_key = self.window_key(at);
        self.store
            .increment_heatmap(&window_key, &cell.key(), self.heatmap.ttl())
            .await
    }

    /// Most-clicked cells of the window containing `at`, most clicks first.
    ///
    /// Members that are not cell keys are skipped.
    pub async fn hot_cells(
        &self,
        at: DateTime<Utc>,
        quantizer: &GridQuantizer,
    ) -> Result<Vec<HotCell>, StoreError> {
        let members = self
            .store
            .hot_members(&self.window_key(at), self.heatmap.hot_limit)
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|(member, clicks)| {
                let cell = CellCoord::parse_key(&member)?;
                Some(HotCell {
                    coordinate_pair: quantizer.dequantize(cell),
                    cell,
                    clicks,
                })
            })
            .collect())
    }

    /// Heatmap key of the window containing `at`.
    pub fn window_key(&self, at: DateTime<Utc>) -> String {
        let window = i64::try_from(self.heatmap.window_secs.max(1)).unwrap_or(i64::MAX);
        format!("heatmap:{}", at.timestamp().div_euclid(window))
    }

    /// Replay every durable cell into the cache. Returns the number of cells
    /// written.
    pub async fn rebuild_from<S: CellStore>(&self, cells: &S) -> Result<usize, StoreError> {
        let all = cells.all().await?;
        for cell in &all {
            self.set_color(cell.coord, &cell.color).await?;
        }
        tracing::info!(cells = all.len(), "Fast-path cache rebuilt from durable store");
        Ok(all.len())
    }
}
