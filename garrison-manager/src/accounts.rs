//! OS account provisioning backed by the host's user database.
//!
//! Pools are unprivileged system accounts; creation and removal shell out
//! to the standard tools. Blocking by contract, run on the blocking pool.

use std::collections::BTreeSet;
use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{info, warn};

use garrison_common::{is_pool_name, AccountProvisioner, ProviderFault};

pub struct SystemAccounts;

impl SystemAccounts {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemAccounts {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountProvisioner for SystemAccounts {
    fn create_pool(&self, name: &str, password: &str) -> Result<bool, ProviderFault> {
        let status = Command::new("useradd")
            .args(["--create-home", "--shell", "/usr/sbin/nologin", name])
            .status()
            .map_err(|e| ProviderFault::Io(format!("useradd: {e}")))?;
        if !status.success() {
            warn!(pool = name, code = ?status.code(), "useradd failed");
            return Ok(false);
        }

        let mut child = Command::new("chpasswd")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProviderFault::Io(format!("chpasswd: {e}")))?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(format!("{name}:{password}\n").as_bytes())
                .map_err(|e| ProviderFault::Io(format!("chpasswd stdin: {e}")))?;
        }
        let status = child
            .wait()
            .map_err(|e| ProviderFault::Io(format!("chpasswd wait: {e}")))?;
        info!(pool = name, "pool account created");
        Ok(status.success())
    }

    fn remove_pool(&self, name: &str) -> Result<bool, ProviderFault> {
        let status = Command::new("userdel")
            .args(["--remove", name])
            .status()
            .map_err(|e| ProviderFault::Io(format!("userdel: {e}")))?;
        if status.success() {
            info!(pool = name, "pool account removed");
        } else {
            warn!(pool = name, code = ?status.code(), "userdel failed");
        }
        Ok(status.success())
    }

    fn list_pools(&self) -> Result<BTreeSet<String>, ProviderFault> {
        let output = Command::new("getent")
            .arg("passwd")
            .output()
            .map_err(|e| ProviderFault::Io(format!("getent: {e}")))?;
        if !output.status.success() {
            return Err(ProviderFault::Io("getent passwd failed".into()));
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing
            .lines()
            .filter_map(|line| line.split(':').next())
            .filter(|name| is_pool_name(name))
            .map(str::to_string)
            .collect())
    }
}
