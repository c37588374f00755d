//! Persistence worker binary for the Pixel War grid.
//!
//! Consumes the update queue and makes each accepted write durable:
//! versioned cell record in `PostgreSQL`, ownership score in the ranking
//! set, broadcast to live subscribers.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `pixelwar-config.yaml` (or `PIXELWAR_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` (running migrations), `Dragonfly` and NATS
//! 4. Spawn one consumer task per owned queue partition
//! 5. Spawn the ranking reconciliation task
//! 6. Run until `Ctrl-C`, then let every task finish its current message

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use pixelwar_bus::NatsBus;
use pixelwar_core::config::{LogFormat, LoggingConfig, PixelWarConfig};
use pixelwar_core::ranking::RankingLedger;
use pixelwar_core::worker::PersistenceWorker;
use pixelwar_db::{DragonflyPool, PgCellStore, PostgresPool};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    let owned = config.worker.owned_partitions(config.queue.partitions);
    info!(
        partitions = config.queue.partitions,
        owned = ?owned,
        reconcile_interval_secs = config.worker.reconcile_interval_secs,
        max_deliver = config.queue.max_deliver,
        "pixelwar-worker starting"
    );

    let infra = &config.infrastructure;
    let postgres = PostgresPool::connect(infra)
        .await
        .context("connecting to PostgreSQL")?;
    postgres
        .run_migrations()
        .await
        .context("running migrations")?;
    let dragonfly = DragonflyPool::connect(&infra.dragonfly_url)
        .await
        .context("connecting to Dragonfly")?;
    let bus = NatsBus::connect(&infra.nats_url)
        .await
        .context("connecting to NATS")?;
    // Creates the stream when the API has not done so yet.
    bus.queue(&config.queue)
        .await
        .context("preparing the update queue")?;

    let worker = Arc::new(PersistenceWorker::new(
        PgCellStore::new(&postgres),
        RankingLedger::new(dragonfly, &config.ranking),
        bus.broadcaster(&config.broadcast),
        &config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    for partition in owned {
        let source = bus
            .source(&config.queue, partition)
            .await
            .with_context(|| format!("attaching to partition {partition}"))?;
        let worker = Arc::clone(&worker);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { worker.run(source, partition, shutdown).await });
        info!(partition, "Partition consumer spawned");
    }

    let interval = Duration::from_secs(config.worker.reconcile_interval_secs);
    let reconciler = Arc::clone(&worker);
    let shutdown = shutdown_rx.clone();
    tasks.spawn(async move { reconciler.reconcile_loop(interval, shutdown).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown requested");
        }
        Some(joined) = tasks.join_next() => {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task terminated");
            }
        }
    }

    // Receivers may already be gone when every task has ended.
    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Worker task terminated");
        }
    }

    bus.flush().await.context("flushing NATS")?;
    postgres.close().await;
    info!("pixelwar-worker stopped");
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
