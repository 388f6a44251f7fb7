//! Garrison per-host manager daemon.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use garrison_common::TcpBus;
use garrison_manager::accounts::SystemAccounts;
use garrison_manager::agent::ManagerAgent;
use garrison_manager::config::ManagerConfig;
use garrison_manager::spawn::{ProcessSpawner, SpawnEnv};

#[derive(Parser, Debug)]
#[command(name = "garrison-manager", version = "0.1.0")]
#[command(about = "Garrison per-host manager")]
struct Cli {
    /// Path to garrison-manager.toml
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

    let mut config = ManagerConfig::load(cli.config.as_deref())?;
    if let Some(bus) = cli.bus {
        config.bus_addr = bus;
    }

    let hostname = match &config.hostname {
        Some(name) => name.clone(),
        None => nix::unistd::gethostname()
            .context("failed to read hostname")?
            .to_string_lossy()
            .to_string(),
    };

    let bus = Arc::new(
        TcpBus::connect(&config.bus_addr)
            .await
            .with_context(|| format!("failed to reach broker at {}", config.bus_addr))?,
    );
    info!(bus = %config.bus_addr, host = %hostname, "manager connected to broker");

    let spawner = ProcessSpawner::new(SpawnEnv {
        worker_bin: config.worker_bin.clone(),
        bus_addr: config.bus_addr.clone(),
        hostname: hostname.clone(),
        bus_secret: std::env::var("GARRISON_SECRET").ok(),
    });

    let agent = ManagerAgent::new(
        bus,
        &hostname,
        Arc::new(SystemAccounts::new()),
        Arc::new(spawner),
        Duration::from_millis(config.ident_delay_ms),
        Duration::from_secs(config.heartbeat_secs),
    );

    tokio::select! {
        result = agent.run() => {
            result?;
            info!("manager stopped by confirmed shutdown");
        }
        _ = sigterm() => {
            warn!("manager stopped by signal");
        }
    }
    Ok(())
}

async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
