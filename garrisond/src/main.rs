//! Garrison HQ daemon.
//!
//! Routes operator commands and directives to the fleet's managers and
//! workers over the bus, enforces the hierarchical permission model, and
//! streams receipts and console output back to connected operators.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UnixListener;
use tracing::{info, warn};

use garrison_common::{PermissionStore, TcpBus};

use garrisond::config::HqConfig;
use garrisond::operator;
use garrisond::router::Router;

#[derive(Parser, Debug)]
#[command(name = "garrisond", version = "0.1.0")]
#[command(about = "Garrison HQ daemon")]
struct Cli {
    /// Path to garrisond.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker endpoint (overrides config)
    #[arg(long)]
    bus: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut config = HqConfig::load(cli.config.as_deref())?;
    if let Some(bus) = cli.bus {
        config.bus_addr = bus;
    }
    let secret = config.secret();

    let store = match &config.snapshot {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), "loading permission snapshot");
            PermissionStore::load_snapshot(path, &config.admin)
                .with_context(|| format!("failed to load snapshot {}", path.display()))?
        }
        _ => PermissionStore::new(&config.admin),
    };

    let bus = Arc::new(
        TcpBus::connect(&config.bus_addr)
            .await
            .with_context(|| format!("failed to reach broker at {}", config.bus_addr))?,
    );
    info!(bus = %config.bus_addr, "connected to broker");

    let router = Router::new(
        bus,
        store,
        config.objstore.clone(),
        config.snapshot.clone(),
    );
    router.run().await?;
    router.spawn_reaper(Duration::from_secs(config.promise_ttl_secs));
    if let Some(ttl) = config.satellite_ttl_secs.filter(|secs| *secs > 0) {
        router.spawn_staleness_sweep(Duration::from_secs(ttl));
    }

    let _ = std::fs::remove_file(&config.operator_socket);
    let listener = UnixListener::bind(&config.operator_socket).with_context(|| {
        format!(
            "failed to bind operator socket {}",
            config.operator_socket.display()
        )
    })?;
    info!(socket = %config.operator_socket.display(), "listening for operators");

    let serve_router = router.clone();
    tokio::spawn(async move {
        if let Err(e) = operator::serve(listener, serve_router, secret).await {
            warn!("operator listener stopped: {e}");
        }
    });

    wait_for_shutdown().await;
    info!("shutting down, flushing permission snapshot");
    router.flush_snapshot().await;
    let _ = std::fs::remove_file(&config.operator_socket);
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
