//! REST endpoint handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/pixels` | Claim a cell (fast path) |
//! | `GET` | `/api/pixels` | Cells inside raw bounds |
//! | `GET` | `/api/pixels/color` | Color of the cell under a raw coordinate |
//! | `GET` | `/api/pixels/all` | Every claimed cell |
//! | `GET` | `/api/pixels/hot` | Most clicked cells of the current heatmap window |
//! | `GET` | `/api/ranks` | Leaderboard |
//! | `GET` | `/health` | Liveness probe |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use chrono::Utc;
use pixelwar_core::backend::Backend;
use pixelwar_core::cells::CellStore as _;
use pixelwar_types::{Cell, CellColor, HotCell, PaintOutcome, PaintRequest, PixelView, RankEntry};

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameter structs
// ---------------------------------------------------------------------------

/// Query parameters for `GET /api/pixels`.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionQuery {
    /// Lower bound on the first axis (raw coordinate).
    pub min_x: f64,
    /// Upper bound on the first axis (raw coordinate).
    pub max_x: f64,
    /// Lower bound on the second axis (raw coordinate).
    pub min_y: f64,
    /// Upper bound on the second axis (raw coordinate).
    pub max_y: f64,
}

/// Query parameters for `GET /api/pixels/color`.
#[derive(Debug, serde::Deserialize)]
pub struct ColorQuery {
    /// First axis (raw coordinate).
    pub x: f64,
    /// Second axis (raw coordinate).
    pub y: f64,
}

/// Query parameters for `GET /api/ranks`.
#[derive(Debug, serde::Deserialize)]
pub struct RanksQuery {
    /// Number of rows (default `ranking.default_top_k`, capped at
    /// `ranking.max_top_k`).
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// POST /api/pixels
// ---------------------------------------------------------------------------

/// Run a write through the fast path.
///
/// Answers `200 {"status":"ok"}` once the update is enqueued; rejections
/// carry their outcome body with 429, 409 or 503.
pub async fn paint<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Json(request): Json<PaintRequest>,
) -> Result<Json<PaintOutcome>, ApiError> {
    match state.paint.paint(&request).await {
        Ok(_receipt) => Ok(Json(PaintOutcome::Ok)),
        Err(e) => {
            tracing::debug!(user_id = %request.user_id, kind = ?e.kind(), error = %e, "Paint rejected");
            Err(ApiError::Paint(e))
        }
    }
}

// ---------------------------------------------------------------------------
// GET /api/pixels
// ---------------------------------------------------------------------------

/// Cells whose index lies between the quantized bounds, inclusive.
pub async fn region<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Query(query): Query<RegionQuery>,
) -> Result<Json<Vec<PixelView>>, ApiError> {
    let bounds = [query.min_x, query.max_x, query.min_y, query.max_y];
    if bounds.iter().any(|v| !v.is_finite()) {
        return Err(ApiError::InvalidQuery(String::from(
            "region bounds must be finite numbers",
        )));
    }

    let quantizer = state.quantizer();
    let min = quantizer.quantize(query.min_x, query.min_y);
    let max = quantizer.quantize(query.max_x, query.max_y);
    if min.x > max.x || min.y > max.y {
        return Err(ApiError::InvalidQuery(String::from(
            "region minimum exceeds maximum",
        )));
    }

    let limit = state.config.api.region_max_cells;
    let span = axis_span(min.x, max.x)
        .zip(axis_span(min.y, max.y))
        .and_then(|(w, h)| w.checked_mul(h));
    match span {
        Some(cells) if cells <= limit => {}
        _ => {
            return Err(ApiError::InvalidQuery(format!(
                "region spans more than {limit} cells"
            )));
        }
    }

    let cells = state.cells.find_in_bounds(min, max, limit).await?;
    Ok(Json(views(&state, cells)))
}

/// Number of cells from `lo` to `hi` inclusive.
fn axis_span(lo: i64, hi: i64) -> Option<u64> {
    let diff = hi.checked_sub(lo)?;
    u64::try_from(diff).ok()?.checked_add(1)
}

fn views<B: Backend>(state: &AppState<B>, cells: Vec<Cell>) -> Vec<PixelView> {
    let quantizer = state.quantizer();
    cells
        .into_iter()
        .map(|cell| PixelView {
            coordinate_pair: quantizer.dequantize(cell.coord),
            color: cell.color,
            user_id: cell.owner,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// GET /api/pixels/color
// ---------------------------------------------------------------------------

/// Color of the cell under a raw coordinate: cache first, then the durable
/// record, then the blank color.
pub async fn color<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Query(query): Query<ColorQuery>,
) -> Result<Json<CellColor>, ApiError> {
    if !(query.x.is_finite() && query.y.is_finite()) {
        return Err(ApiError::InvalidQuery(String::from(
            "coordinates must be finite numbers",
        )));
    }

    let cell = state.quantizer().quantize(query.x, query.y);
    let cache = state.paint.cache();
    let color = match cache.cached_color(cell).await? {
        Some(color) => color,
        None => match state.cells.find(cell).await? {
            Some(record) => record.color,
            None => cache.blank_color().to_owned(),
        },
    };

    Ok(Json(CellColor { cell, color }))
}

// ---------------------------------------------------------------------------
// GET /api/pixels/all
// ---------------------------------------------------------------------------

/// Every claimed cell.
pub async fn all_pixels<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<Vec<PixelView>>, ApiError> {
    let cells = state.cells.all().await?;
    Ok(Json(views(&state, cells)))
}

// ---------------------------------------------------------------------------
// GET /api/pixels/hot
// ---------------------------------------------------------------------------

/// Most clicked cells of the current heatmap window.
pub async fn hot_pixels<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<Vec<HotCell>>, ApiError> {
    let hot = state
        .paint
        .cache()
        .hot_cells(Utc::now(), state.quantizer())
        .await?;
    Ok(Json(hot))
}

// ---------------------------------------------------------------------------
// GET /api/ranks
// ---------------------------------------------------------------------------

/// Top-k leaderboard.
pub async fn ranks<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Query(query): Query<RanksQuery>,
) -> Result<Json<Vec<RankEntry>>, ApiError> {
    let k = state.ranking.clamp_k(query.limit);
    let entries = state.ranking.top_k(k).await?;
    Ok(Json(entries))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
