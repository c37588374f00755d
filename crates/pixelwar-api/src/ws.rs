//! `WebSocket` handler for the live pixel stream.
//!
//! Clients connect to `GET /ws/pixels` and receive one JSON-encoded
//! [`PixelBroadcast`](pixelwar_types::PixelBroadcast) text frame per applied
//! update on the configured broadcast channel. Delivery is best effort: a
//! client that falls behind skips ahead to the newest message.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use pixelwar_core::backend::Backend;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::state::AppState;

/// Upgrade an HTTP request to a `WebSocket` connection and begin streaming
/// pixel updates.
///
/// # Route
///
/// `GET /ws/pixels`
pub async fn ws_pixels<B: Backend>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<B>>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

async fn handle_ws<B: Backend>(mut socket: WebSocket, state: Arc<AppState<B>>) {
    debug!("WebSocket client connected");

    let mut rx = state.subscribe();
    let channel = state.config.broadcast.channel.clone();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(message) => {
                        if message.channel != channel {
                            continue;
                        }
                        let text = match String::from_utf8(message.payload) {
                            Ok(text) => text,
                            Err(e) => {
                                debug!(error = %e, "Dropping non-UTF-8 broadcast");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            debug!("WebSocket client disconnected (send failed)");
                            return;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "WebSocket client lagged, skipping ahead");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast hub closed, shutting down WebSocket");
                        return;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        return;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            debug!("WebSocket client disconnected (pong failed)");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket error");
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
