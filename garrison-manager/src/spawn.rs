//! Privileged worker spawn.
//!
//! The worker must run under the pool's own unprivileged account, fully
//! detached from the manager: double-fork with a new session in the first
//! child so the grandchild is reparented to init, gid-then-uid drop in the
//! grandchild BEFORE anything pool-specific executes, then exec of the
//! worker binary. Bus credentials travel in the exec's argv/environment,
//! never in a file the pool account might not be able to read.

use std::ffi::CString;
use std::path::Path;

use nix::sys::wait::waitpid;
use nix::unistd::{execvpe, fork, setgid, setsid, setuid, ForkResult, User};
use tracing::info;

use garrison_common::ProviderFault;

/// Everything the grandchild needs to reach the bus.
#[derive(Debug, Clone)]
pub struct SpawnEnv {
    pub worker_bin: String,
    pub bus_addr: String,
    pub hostname: String,
    pub bus_secret: Option<String>,
}

/// Resolve the pool account and launch a detached worker bound to `pool`.
///
/// Blocking (fork + waitpid); callers run it on the blocking pool.
pub fn spawn_detached_worker(env: &SpawnEnv, pool: &str) -> Result<(), ProviderFault> {
    let account = User::from_name(pool)
        .map_err(|e| ProviderFault::Io(format!("account lookup {pool}: {e}")))?
        .ok_or_else(|| ProviderFault::Validation(format!("no account for pool {pool}")))?;

    let argv = build_argv(env, pool)?;
    let envp = build_envp(env)?;

    match unsafe { fork() }.map_err(|e| ProviderFault::Io(format!("fork: {e}")))? {
        ForkResult::Parent { child } => {
            // The first child exits as soon as it has forked again; reap it
            // and detach from everything below.
            waitpid(child, None).map_err(|e| ProviderFault::Io(format!("waitpid: {e}")))?;
            info!(pool, uid = %account.uid, "worker spawn detached");
            Ok(())
        }
        ForkResult::Child => {
            let _ = setsid();
            match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                Ok(ForkResult::Child) => {
                    // Grandchild: privileges drop before any pool-specific
                    // code path, gid first while still root.
                    if setgid(account.gid).is_err() || setuid(account.uid).is_err() {
                        unsafe { libc::_exit(71) };
                    }
                    let _ = execvpe(&argv[0], &argv, &envp);
                    // Only reached when exec failed.
                    unsafe { libc::_exit(72) }
                }
                Err(_) => unsafe { libc::_exit(70) },
            }
        }
    }
}

fn build_argv(env: &SpawnEnv, pool: &str) -> Result<Vec<CString>, ProviderFault> {
    [
        env.worker_bin.as_str(),
        "--bus",
        env.bus_addr.as_str(),
        "--host",
        env.hostname.as_str(),
        "--pool",
        pool,
    ]
    .iter()
    .map(|arg| {
        CString::new(*arg).map_err(|_| ProviderFault::Validation("nul byte in argv".into()))
    })
    .collect()
}

fn build_envp(env: &SpawnEnv) -> Result<Vec<CString>, ProviderFault> {
    let mut vars = vec![format!(
        "PATH={}",
        std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string())
    )];
    if let Some(secret) = &env.bus_secret {
        vars.push(format!("GARRISON_SECRET={secret}"));
    }
    vars.into_iter()
        .map(|var| {
            CString::new(var).map_err(|_| ProviderFault::Validation("nul byte in env".into()))
        })
        .collect()
}

/// Whether `worker_bin` looks launchable before the fork is attempted.
pub fn worker_binary_exists(worker_bin: &str) -> bool {
    let path = Path::new(worker_bin);
    if path.components().count() > 1 {
        return path.is_file();
    }
    // Bare name: rely on PATH at exec time.
    true
}

/// The production [`WorkerSpawner`](crate::agent::WorkerSpawner).
pub struct ProcessSpawner {
    env: SpawnEnv,
}

impl ProcessSpawner {
    pub fn new(env: SpawnEnv) -> Self {
        Self { env }
    }
}

impl crate::agent::WorkerSpawner for ProcessSpawner {
    fn spawn(&self, pool: &str) -> Result<(), ProviderFault> {
        if !worker_binary_exists(&self.env.worker_bin) {
            return Err(ProviderFault::Io(format!(
                "worker binary {} not found",
                self.env.worker_bin
            )));
        }
        spawn_detached_worker(&self.env, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> SpawnEnv {
        SpawnEnv {
            worker_bin: "garrison-worker".into(),
            bus_addr: "127.0.0.1:5670".into(),
            hostname: "host1".into(),
            bus_secret: Some("s3cret".into()),
        }
    }

    #[test]
    fn argv_carries_bus_credentials() {
        let argv = build_argv(&env(), "_alpha-0").unwrap();
        let rendered: Vec<&str> = argv.iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(
            rendered,
            vec![
                "garrison-worker",
                "--bus",
                "127.0.0.1:5670",
                "--host",
                "host1",
                "--pool",
                "_alpha-0"
            ]
        );
    }

    #[test]
    fn envp_carries_secret_and_path() {
        let envp = build_envp(&env()).unwrap();
        let rendered: Vec<&str> = envp.iter().map(|c| c.to_str().unwrap()).collect();
        assert!(rendered.iter().any(|v| v.starts_with("PATH=")));
        assert!(rendered.contains(&"GARRISON_SECRET=s3cret"));
    }

    #[test]
    fn spawning_for_missing_account_fails_validation() {
        let err = spawn_detached_worker(&env(), "_no-such-pool-999").unwrap_err();
        assert!(matches!(err, ProviderFault::Validation(_)));
    }
}
