//! HQ daemon configuration: a TOML file with environment fallbacks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use garrison_common::ObjectStoreCreds;

pub const DEFAULT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Clone, Deserialize)]
pub struct HqConfig {
    /// External broker endpoint.
    #[serde(default = "default_bus_addr")]
    pub bus_addr: String,
    /// Operator-facing Unix socket.
    #[serde(default = "default_operator_socket")]
    pub operator_socket: PathBuf,
    /// Owner of the root permission screen.
    #[serde(default = "default_admin")]
    pub admin: String,
    /// Shared secret authenticating operator sessions.
    #[serde(default)]
    pub secret: Option<String>,
    /// Permission snapshot; loaded at startup, flushed after mutations.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    /// Pending calls older than this resolve as timed out.
    #[serde(default = "default_promise_ttl")]
    pub promise_ttl_secs: u64,
    /// Optional satellite staleness sweep; unset keeps registrations
    /// forever.
    #[serde(default)]
    pub satellite_ttl_secs: Option<u64>,
    /// Object-store credentials pushed to workers that report none.
    #[serde(default)]
    pub objstore: Option<ObjectStoreCreds>,
}

impl Default for HqConfig {
    fn default() -> Self {
        Self {
            bus_addr: default_bus_addr(),
            operator_socket: default_operator_socket(),
            admin: default_admin(),
            secret: None,
            snapshot: None,
            promise_ttl_secs: default_promise_ttl(),
            satellite_ttl_secs: None,
            objstore: None,
        }
    }
}

fn default_bus_addr() -> String {
    "127.0.0.1:5670".to_string()
}

fn default_operator_socket() -> PathBuf {
    PathBuf::from("/tmp/garrisond.sock")
}

fn default_admin() -> String {
    "admin".to_string()
}

fn default_promise_ttl() -> u64 {
    120
}

impl HqConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", p.display()))?
            }
            None => Self::default(),
        };
        if let Ok(addr) = std::env::var("GARRISON_BUS_ADDR") {
            config.bus_addr = addr;
        }
        if let Ok(secret) = std::env::var("GARRISON_SECRET") {
            config.secret = Some(secret);
        }
        Ok(config)
    }

    pub fn secret(&self) -> String {
        match &self.secret {
            Some(s) => s.clone(),
            None => {
                warn!("using default secret - set GARRISON_SECRET in production!");
                DEFAULT_SECRET.to_string()
            }
        }
    }
}
