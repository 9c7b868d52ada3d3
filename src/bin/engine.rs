//! `ignition-engine`: the long-lived daemon. Parses CLI/env configuration,
//! opens the content and metadata stores, builds the shared Wasm runtime,
//! and serves the control socket until interrupted.
//!
//! Startup and shutdown sequencing follows `trunk-rs-trunk/src/cmd/serve.rs`:
//! a `broadcast` shutdown channel raced against `tokio::signal::ctrl_c()`
//! (and `SIGTERM` on unix) via `tokio::select!`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ignition::cache::InstanceCache;
use ignition::config::{EngineArgs, EngineConfig};
use ignition::registry::Registry;
use ignition::server::{self, AppState};
use ignition::store::{metadata::MetadataStore, ContentStore};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = EngineArgs::parse();

    tracing_subscriber::registry()
        .with(args.tracing_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("error initializing logging")?;

    tracing::info!(
        "starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    Ok(match run(args).await {
        Err(err) => {
            tracing::error!("{err}");
            for (n, cause) in err.chain().enumerate().skip(1) {
                tracing::info!("  {n}: {cause}");
            }
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    })
}

async fn run(args: EngineArgs) -> Result<()> {
    let config = EngineConfig::resolve(&args)?;
    config.prepare_filesystem().await?;

    let content = ContentStore::new(config.content_root.clone());
    let metadata =
        MetadataStore::open(&config.metadata_path).context("error opening metadata store")?;
    let registry = Registry::new(content, metadata);

    let engine = ignition::runtime::new_shared_engine().context("error starting wasm runtime")?;
    let cache = Arc::new(InstanceCache::new(
        registry.clone(),
        engine,
        config.log_ring_capacity,
        config.default_timeout_millis,
    ));

    let state = Arc::new(AppState {
        registry,
        cache: cache.clone(),
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let socket_path = config.socket_path.clone();

    let server_handle = tokio::spawn(async move {
        server::serve_uds(&socket_path, state, shutdown_rx).await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("received shutdown signal");
    shutdown_tx.send(()).ok();

    server_handle
        .await
        .context("error awaiting control server shutdown")??;

    cache.unload_all().await;
    remove_socket(&config.socket_path).await;

    tracing::info!("exiting");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("error installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("error installing ctrl-c handler");
}

async fn remove_socket(path: &std::path::Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %err, socket = %path.display(), "error removing control socket");
        }
    }
}
