//! Manager configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_bus_addr")]
    pub bus_addr: String,
    /// Override for the announced hostname; defaults to the kernel's.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Worker entry point exec'd into spawned pool processes.
    #[serde(default = "default_worker_bin")]
    pub worker_bin: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// IDENT replies are debounced by this base delay plus jitter.
    #[serde(default = "default_ident_delay_ms")]
    pub ident_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bus_addr: default_bus_addr(),
            hostname: None,
            worker_bin: default_worker_bin(),
            heartbeat_secs: default_heartbeat_secs(),
            ident_delay_ms: default_ident_delay_ms(),
        }
    }
}

fn default_bus_addr() -> String {
    "127.0.0.1:5670".to_string()
}

fn default_worker_bin() -> String {
    "garrison-worker".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_ident_delay_ms() -> u64 {
    400
}

impl ManagerConfig {
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
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config: ManagerConfig = toml::from_str("").unwrap();
        assert_eq!(config.worker_bin, "garrison-worker");
        assert_eq!(config.heartbeat_secs, 30);
        assert!(config.hostname.is_none());
    }

    #[test]
    fn overrides_parse() {
        let config: ManagerConfig = toml::from_str(
            r#"
                bus_addr = "bus:5670"
                hostname = "host9"
                worker_bin = "/usr/local/bin/garrison-worker"
                ident_delay_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.hostname.as_deref(), Some("host9"));
        assert_eq!(config.ident_delay_ms, 50);
    }
}
