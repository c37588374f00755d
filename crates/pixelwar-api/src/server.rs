//! Listener lifecycle of the API process.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use pixelwar_core::backend::Backend;
use pixelwar_core::config::InfrastructureConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Where the API listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind.
    pub ip: IpAddr,
    /// TCP port.
    pub port: u16,
}

impl ServerConfig {
    /// Every interface at `port`.
    pub const fn on_port(port: u16) -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        }
    }

    /// Socket address to bind.
    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<&InfrastructureConfig> for ServerConfig {
    fn from(infra: &InfrastructureConfig) -> Self {
        Self::on_port(infra.http_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&InfrastructureConfig::default())
    }
}

/// Serve the pixel routes until `shutdown` resolves.
///
/// In-flight requests (including a paint holding a cell lock) are allowed
/// to finish; open `WebSocket` streams end with the process.
///
/// # Errors
///
/// [`ServerError::Bind`] when the port is taken, [`ServerError::Serve`] on a
/// fatal accept-loop failure.
pub async fn start_server<B, F>(
    config: ServerConfig,
    state: Arc<AppState<B>>,
    shutdown: F,
) -> Result<(), ServerError>
where
    B: Backend,
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "pixel API listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)?;

    info!(%addr, "pixel API drained");
    Ok(())
}

/// Failures of the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The address could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// OS error.
        source: std::io::Error,
    },

    /// The accept loop failed.
    #[error("server failed: {0}")]
    Serve(std::io::Error),
}
