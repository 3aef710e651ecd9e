//! Strata Coordinator
//!
//! Runs the bucket cache, its background sweep and snapshot tasks, and the
//! storage node queue API.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use strata_bucket::BucketCoordinator;
use strata_common::Config;
use strata_coordinator::{AppState, router};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-coordinator")]
#[command(about = "Strata bucket cache and storage node coordinator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for the queue API (overrides the configuration)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides the configuration)
    #[arg(long)]
    log_level: Option<String>,

    /// Write the default configuration to --config and exit
    #[arg(long, default_value_t = false)]
    write_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.write_default_config {
        let path = args
            .config
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--write-default-config requires --config"))?;
        Config::write_default(path)?;
        info!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    info!("Starting Strata coordinator");
    info!("Bucket root: {}", config.buckets.root.display());
    info!("Snapshot: {}", config.snapshot_path().display());
    info!(
        "Cache capacity: {} bytes, commit grace: {} ms",
        config.cache.max_bucket_cache_size, config.cache.max_commit_queue_time_ms
    );

    let coordinator = BucketCoordinator::open(&config)?;

    if config.server.storage_node_secret.is_none() {
        warn!("No storage node secret configured; every queue API request will be refused");
    }

    // Background maintenance
    let sweeper = tokio::spawn(
        coordinator
            .clone()
            .sweep_loop(config.cache.sweep_interval()),
    );
    let snapshotter = tokio::spawn(
        coordinator
            .clone()
            .snapshot_loop(config.node.snapshot_interval()),
    );

    let state = Arc::new(AppState::new(coordinator.clone(), &config.server));
    let app = router(state);

    // Parse listen address
    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", listen, e))?;

    info!("Starting queue API server on {}", addr);

    // Start server
    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    sweeper.abort();
    snapshotter.abort();

    coordinator.save().await?;
    info!("Coordinator shut down gracefully");

    Ok(())
}
