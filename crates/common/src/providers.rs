//! External collaborator contracts.
//!
//! The game-server process supervisor, the OS account provisioner and the
//! object-storage backend are not part of the control plane; they are
//! specified here at their boundary only. All three are blocking by
//! contract; callers off-load invocations to the blocking pool so the
//! event loop never waits on them.
//!
//! The `memory` module holds in-process implementations used by tests and
//! by single-process development mode.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fault taxonomy shared by every collaborator.
///
/// These are the only failures a supervisor invocation may surface; each is
/// reported back to the caller with a structured exception header and is
/// never fatal to the worker.
#[derive(Debug, Clone, Error)]
pub enum ProviderFault {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("bad argument: {0}")]
    Argument(String),
    #[error("i/o fault: {0}")]
    Io(String),
    #[error("storage network fault: {0}")]
    StorageNetwork(String),
}

impl ProviderFault {
    /// Wire name used in `exception{name}` headers.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProviderFault::Validation(_) => "ValidationError",
            ProviderFault::Argument(_) => "ArgumentError",
            ProviderFault::Io(_) => "IOFault",
            ProviderFault::StorageNetwork(_) => "StorageNetworkFault",
        }
    }
}

/// The per-server process supervisor.
pub trait ServerSupervisor: Send + Sync {
    fn supports(&self, cmd: &str) -> bool;

    /// Execute `cmd` against `server` with positional arguments.
    fn invoke(
        &self,
        server: &str,
        cmd: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ProviderFault>;

    /// Names of the server directories that currently exist under the pool.
    fn list_servers(&self) -> Result<BTreeSet<String>, ProviderFault>;

    /// A blocking line stream over the server's console output. The
    /// iterator ends when `stop` is set (checked between reads).
    fn tail_console(
        &self,
        server: &str,
        stop: Arc<AtomicBool>,
    ) -> Result<Box<dyn Iterator<Item = String> + Send>, ProviderFault>;
}

/// OS account provisioning for pools.
pub trait AccountProvisioner: Send + Sync {
    fn create_pool(&self, name: &str, password: &str) -> Result<bool, ProviderFault>;
    fn remove_pool(&self, name: &str) -> Result<bool, ProviderFault>;
    fn list_pools(&self) -> Result<BTreeSet<String>, ProviderFault>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreCreds {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Archive storage backend.
pub trait ObjectStore: Send + Sync {
    /// Credentials currently configured, if a client has been established.
    fn credentials(&self) -> Option<ObjectStoreCreds>;
    /// Establish a client with `creds`.
    fn configure(&self, creds: ObjectStoreCreds) -> Result<(), ProviderFault>;

    fn exists(&self, bucket: &str) -> Result<bool, ProviderFault>;
    fn create(&self, bucket: &str) -> Result<(), ProviderFault>;
    fn destroy(&self, bucket: &str) -> Result<(), ProviderFault>;
    fn list(&self, bucket: &str) -> Result<BTreeSet<String>, ProviderFault>;
    fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ProviderFault>;
    fn download(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ProviderFault>;
}

pub mod memory {
    //! In-process collaborator implementations.

    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::{
        AccountProvisioner, ObjectStore, ObjectStoreCreds, ProviderFault, ServerSupervisor,
    };

    const KNOWN_COMMANDS: &[&str] = &[
        "create", "delete", "start", "stop", "kill", "status", "backup", "restore", "say",
    ];

    /// Blocking console iterator fed by an mpsc channel; polls the stop
    /// flag between receive timeouts.
    pub struct ConsoleIter {
        rx: Receiver<String>,
        stop: Arc<AtomicBool>,
    }

    impl Iterator for ConsoleIter {
        type Item = String;

        fn next(&mut self) -> Option<String> {
            loop {
                if self.stop.load(Ordering::SeqCst) {
                    return None;
                }
                match self.rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(line) => return Some(line),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return None,
                }
            }
        }
    }

    #[derive(Default)]
    pub struct MemorySupervisor {
        servers: Mutex<BTreeSet<String>>,
        consoles: Mutex<HashMap<String, Vec<Sender<String>>>>,
        faults: Mutex<HashMap<String, ProviderFault>>,
        results: Mutex<HashMap<String, Value>>,
        invocations: Mutex<Vec<(String, String, Vec<Value>)>>,
    }

    impl MemorySupervisor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_servers(names: &[&str]) -> Self {
            let sup = Self::new();
            let mut servers = sup.servers.lock().unwrap();
            for name in names {
                servers.insert(name.to_string());
            }
            drop(servers);
            sup
        }

        /// Make `cmd` fail with `fault` on its next invocations.
        pub fn inject_fault(&self, cmd: &str, fault: ProviderFault) {
            self.faults.lock().unwrap().insert(cmd.to_string(), fault);
        }

        pub fn set_result(&self, cmd: &str, value: Value) {
            self.results.lock().unwrap().insert(cmd.to_string(), value);
        }

        /// Feed a console line to every tail of `server`.
        pub fn push_console(&self, server: &str, line: &str) {
            let mut consoles = self.consoles.lock().unwrap();
            if let Some(tails) = consoles.get_mut(server) {
                tails.retain(|tx| tx.send(line.to_string()).is_ok());
            }
        }

        pub fn invocations(&self) -> Vec<(String, String, Vec<Value>)> {
            self.invocations.lock().unwrap().clone()
        }

        pub fn tail_count(&self, server: &str) -> usize {
            self.consoles
                .lock()
                .unwrap()
                .get(server)
                .map(|t| t.len())
                .unwrap_or(0)
        }
    }

    impl ServerSupervisor for MemorySupervisor {
        fn supports(&self, cmd: &str) -> bool {
            KNOWN_COMMANDS.contains(&cmd)
        }

        fn invoke(
            &self,
            server: &str,
            cmd: &str,
            args: Vec<Value>,
        ) -> Result<Value, ProviderFault> {
            if let Some(fault) = self.faults.lock().unwrap().get(cmd) {
                return Err(fault.clone());
            }
            self.invocations
                .lock()
                .unwrap()
                .push((server.to_string(), cmd.to_string(), args.clone()));

            let mut servers = self.servers.lock().unwrap();
            match cmd {
                "create" => {
                    servers.insert(server.to_string());
                }
                "delete" => {
                    servers.remove(server);
                }
                _ => {}
            }
            drop(servers);

            if let Some(value) = self.results.lock().unwrap().get(cmd) {
                return Ok(value.clone());
            }
            Ok(json!({ "ok": true }))
        }

        fn list_servers(&self) -> Result<BTreeSet<String>, ProviderFault> {
            Ok(self.servers.lock().unwrap().clone())
        }

        fn tail_console(
            &self,
            server: &str,
            stop: Arc<AtomicBool>,
        ) -> Result<Box<dyn Iterator<Item = String> + Send>, ProviderFault> {
            let (tx, rx) = std::sync::mpsc::channel();
            self.consoles
                .lock()
                .unwrap()
                .entry(server.to_string())
                .or_default()
                .push(tx);
            Ok(Box::new(ConsoleIter { rx, stop }))
        }
    }

    #[derive(Default)]
    pub struct MemoryProvisioner {
        pools: Mutex<BTreeSet<String>>,
        refuse_creation: AtomicBool,
    }

    impl MemoryProvisioner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `create_pool` report failure without creating anything.
        pub fn refuse_creation(&self) {
            self.refuse_creation.store(true, Ordering::SeqCst);
        }
    }

    impl AccountProvisioner for MemoryProvisioner {
        fn create_pool(&self, name: &str, _password: &str) -> Result<bool, ProviderFault> {
            if self.refuse_creation.load(Ordering::SeqCst) {
                return Ok(false);
            }
            Ok(self.pools.lock().unwrap().insert(name.to_string()))
        }

        fn remove_pool(&self, name: &str) -> Result<bool, ProviderFault> {
            Ok(self.pools.lock().unwrap().remove(name))
        }

        fn list_pools(&self) -> Result<BTreeSet<String>, ProviderFault> {
            Ok(self.pools.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    pub struct MemoryObjectStore {
        creds: Mutex<Option<ObjectStoreCreds>>,
        buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    }

    impl MemoryObjectStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_creds(creds: ObjectStoreCreds) -> Self {
            let store = Self::new();
            *store.creds.lock().unwrap() = Some(creds);
            store
        }
    }

    impl ObjectStore for MemoryObjectStore {
        fn credentials(&self) -> Option<ObjectStoreCreds> {
            self.creds.lock().unwrap().clone()
        }

        fn configure(&self, creds: ObjectStoreCreds) -> Result<(), ProviderFault> {
            if creds.endpoint.trim().is_empty() {
                return Err(ProviderFault::StorageNetwork(
                    "empty object-store endpoint".into(),
                ));
            }
            *self.creds.lock().unwrap() = Some(creds);
            Ok(())
        }

        fn exists(&self, bucket: &str) -> Result<bool, ProviderFault> {
            Ok(self.buckets.lock().unwrap().contains_key(bucket))
        }

        fn create(&self, bucket: &str) -> Result<(), ProviderFault> {
            self.buckets
                .lock()
                .unwrap()
                .entry(bucket.to_string())
                .or_default();
            Ok(())
        }

        fn destroy(&self, bucket: &str) -> Result<(), ProviderFault> {
            self.buckets.lock().unwrap().remove(bucket);
            Ok(())
        }

        fn list(&self, bucket: &str) -> Result<BTreeSet<String>, ProviderFault> {
            self.buckets
                .lock()
                .unwrap()
                .get(bucket)
                .map(|objects| objects.keys().cloned().collect())
                .ok_or_else(|| ProviderFault::StorageNetwork(format!("no bucket {bucket}")))
        }

        fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ProviderFault> {
            let bytes =
                std::fs::read(path).map_err(|e| ProviderFault::Io(format!("read archive: {e}")))?;
            self.buckets
                .lock()
                .unwrap()
                .get_mut(bucket)
                .ok_or_else(|| ProviderFault::StorageNetwork(format!("no bucket {bucket}")))?
                .insert(key.to_string(), bytes);
            Ok(())
        }

        fn download(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ProviderFault> {
            let buckets = self.buckets.lock().unwrap();
            let bytes = buckets
                .get(bucket)
                .and_then(|objects| objects.get(key))
                .ok_or_else(|| {
                    ProviderFault::StorageNetwork(format!("no object {bucket}/{key}"))
                })?;
            std::fs::write(path, bytes).map_err(|e| ProviderFault::Io(format!("write archive: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[test]
    fn supervisor_create_delete_mutate_inventory() {
        let sup = MemorySupervisor::new();
        sup.invoke("srv1", "create", vec![]).unwrap();
        assert!(sup.list_servers().unwrap().contains("srv1"));
        sup.invoke("srv1", "delete", vec![]).unwrap();
        assert!(!sup.list_servers().unwrap().contains("srv1"));
    }

    #[test]
    fn injected_fault_surfaces_with_kind_name() {
        let sup = MemorySupervisor::new();
        sup.inject_fault("start", ProviderFault::Validation("no jar".into()));
        let err = sup.invoke("srv1", "start", vec![]).unwrap_err();
        assert_eq!(err.kind_name(), "ValidationError");
    }

    #[test]
    fn console_tail_sees_pushed_lines_until_stopped() {
        let sup = MemorySupervisor::new();
        let stop = Arc::new(AtomicBool::new(false));
        let mut tail = sup.tail_console("srv1", stop.clone()).unwrap();
        sup.push_console("srv1", "hello");
        assert_eq!(tail.next().as_deref(), Some("hello"));
        stop.store(true, Ordering::SeqCst);
        assert_eq!(tail.next(), None);
    }

    #[test]
    fn object_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.tgz");
        let dst = dir.path().join("out.tgz");
        std::fs::write(&src, b"archive-bytes").unwrap();

        let store = MemoryObjectStore::new();
        assert!(store.credentials().is_none());
        store
            .configure(ObjectStoreCreds {
                endpoint: "http://objstore:9000".into(),
                access_key: "ak".into(),
                secret_key: "sk".into(),
                region: "eu-west-1".into(),
            })
            .unwrap();
        assert!(store.credentials().is_some());

        store.create("backups").unwrap();
        assert!(store.exists("backups").unwrap());
        store.upload("backups", "srv1.tgz", &src).unwrap();
        assert_eq!(
            store.list("backups").unwrap(),
            ["srv1.tgz".to_string()].into_iter().collect()
        );
        store.download("backups", "srv1.tgz", &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"archive-bytes");
    }

    #[test]
    fn configure_rejects_empty_endpoint() {
        let store = MemoryObjectStore::new();
        let err = store
            .configure(ObjectStoreCreds {
                endpoint: "".into(),
                access_key: "ak".into(),
                secret_key: "sk".into(),
                region: "r".into(),
            })
            .unwrap_err();
        assert_eq!(err.kind_name(), "StorageNetworkFault");
        assert!(store.credentials().is_none());
    }

    #[test]
    fn provisioner_lists_created_pools() {
        let prov = MemoryProvisioner::new();
        assert!(prov.create_pool("_alpha-0", "pw").unwrap());
        assert!(prov.list_pools().unwrap().contains("_alpha-0"));
        assert!(prov.remove_pool("_alpha-0").unwrap());
        assert!(prov.list_pools().unwrap().is_empty());
    }

    #[test]
    fn scripted_result_passes_through() {
        let sup = MemorySupervisor::new();
        sup.set_result("status", json!({"state": "running"}));
        let out = sup.invoke("srv1", "status", vec![]).unwrap();
        assert_eq!(out, json!({"state": "running"}));
    }
}
