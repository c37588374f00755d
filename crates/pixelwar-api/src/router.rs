//! Axum router construction.
//!
//! Assembles the REST and `WebSocket` routes into a single [`Router`] with
//! CORS and request tracing enabled.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use pixelwar_core::backend::Backend;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete router for one backend.
///
/// - `POST /api/pixels` -- claim a cell
/// - `GET /api/pixels` -- region lookup
/// - `GET /api/pixels/color` -- single-cell color
/// - `GET /api/pixels/all` -- every claimed cell
/// - `GET /api/pixels/hot` -- heatmap hot cells
/// - `GET /api/ranks` -- leaderboard
/// - `GET /ws/pixels` -- live pixel stream
/// - `GET /health` -- liveness
pub fn build_router<B: Backend>(state: Arc<AppState<B>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws/pixels", get(ws::ws_pixels::<B>))
        .route(
            "/api/pixels",
            get(handlers::region::<B>).post(handlers::paint::<B>),
        )
        .route("/api/pixels/color", get(handlers::color::<B>))
        .route("/api/pixels/all", get(handlers::all_pixels::<B>))
        .route("/api/pixels/hot", get(handlers::hot_pixels::<B>))
        .route("/api/ranks", get(handlers::ranks::<B>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
