//! API server binary for the Pixel War grid.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `pixelwar-config.yaml` (or `PIXELWAR_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `Dragonfly`, `PostgreSQL` (running migrations) and NATS
//! 4. Build the fast path over the live backend
//! 5. Optionally rebuild the color cache from the durable store
//! 6. Relay worker broadcasts into the local fan-out hub
//! 7. Serve HTTP + `WebSocket` until `Ctrl-C`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt as _;
use pixelwar_api::relay::relay_broadcasts;
use pixelwar_api::{AppState, Collaborators, LiveBackend, ServerConfig, start_server};
use pixelwar_bus::NatsBus;
use pixelwar_core::config::{LogFormat, LoggingConfig, PixelWarConfig};
use pixelwar_db::{DragonflyPool, PgCellStore, PostgresPool};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);
    info!(
        grid_size = config.grid.size,
        partitions = config.queue.partitions,
        http_port = config.infrastructure.http_port,
        "pixelwar-api starting"
    );

    let infra = &config.infrastructure;
    let dragonfly = DragonflyPool::connect(&infra.dragonfly_url)
        .await
        .context("connecting to Dragonfly")?;
    let postgres = PostgresPool::connect(infra)
        .await
        .context("connecting to PostgreSQL")?;
    postgres
        .run_migrations()
        .await
        .context("running migrations")?;
    let bus = NatsBus::connect(&infra.nats_url)
        .await
        .context("connecting to NATS")?;
    let queue = bus
        .queue(&config.queue)
        .await
        .context("preparing the update queue")?;

    let parts = Collaborators::live(&dragonfly, queue, PgCellStore::new(&postgres));
    let state: Arc<AppState<LiveBackend>> = Arc::new(AppState::new(parts, config.clone()));

    if config.cache.rebuild_on_start {
        let rebuilt = state
            .paint
            .cache()
            .rebuild_from(&state.cells)
            .await
            .context("rebuilding the color cache")?;
        info!(cells = rebuilt, "Color cache rebuilt from durable store");
    }

    let channel = config.broadcast.channel.clone();
    let subscriber = bus
        .subscribe_broadcasts(&config.broadcast, &channel)
        .await
        .context("subscribing to broadcasts")?;
    let hub = state.broadcaster.clone();
    let relay = tokio::spawn(async move {
        let payloads = subscriber.map(|message| message.payload.to_vec());
        relay_broadcasts(payloads, &channel, &hub).await
    });

    start_server(
        ServerConfig::from(&config.infrastructure),
        state,
        shutdown_signal(),
    )
    .await
    .context("serving HTTP")?;

    relay.abort();
    postgres.close().await;
    info!("pixelwar-api stopped");
    Ok(())
}

/// Load configuration from `PIXELWAR_CONFIG` or `pixelwar-config.yaml`,
/// falling back to defaults when the file is absent.
fn load_config() -> anyhow::Result<PixelWarConfig> {
    let path = std::env::var("PIXELWAR_CONFIG")
        .map_or_else(|_| PathBuf::from("pixelwar-config.yaml"), PathBuf::from);
    PixelWarConfig::load_or_default(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
