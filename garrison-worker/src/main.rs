//! Garrison per-pool worker daemon.
//!
//! Launched by the manager under the pool's own account; bus coordinates
//! arrive through the spawn invocation, never from a file.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use garrison_common::providers::memory::MemoryObjectStore;
use garrison_common::TcpBus;
use garrison_worker::agent::WorkerAgent;
use garrison_worker::disk_supervisor::DiskSupervisor;

#[derive(Parser, Debug)]
#[command(name = "garrison-worker", version = "0.1.0")]
#[command(about = "Garrison per-pool worker")]
struct Cli {
    /// Broker endpoint
    #[arg(long)]
    bus: String,

    /// Host this pool lives on
    #[arg(long)]
    host: Option<String>,

    /// Pool account this worker serves
    #[arg(long)]
    pool: String,

    /// Server directories root; defaults to ~/servers
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

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

    let hostname = match cli.host {
        Some(name) => name,
        None => nix::unistd::gethostname()
            .context("failed to read hostname")?
            .to_string_lossy()
            .to_string(),
    };

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join("servers"))
            .unwrap_or_else(|_| PathBuf::from("./servers"))
    });
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let bus = Arc::new(
        TcpBus::connect(&cli.bus)
            .await
            .with_context(|| format!("failed to reach broker at {}", cli.bus))?,
    );
    info!(
        bus = %cli.bus,
        host = %hostname,
        pool = %cli.pool,
        data_dir = %data_dir.display(),
        "worker connected to broker"
    );

    let agent = WorkerAgent::new(
        bus,
        &hostname,
        &cli.pool,
        Arc::new(DiskSupervisor::new(data_dir)),
        Arc::new(MemoryObjectStore::new()),
        Duration::from_secs(cli.heartbeat_secs),
    );

    tokio::select! {
        result = agent.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("worker stopped by signal");
        }
    }
    Ok(())
}
