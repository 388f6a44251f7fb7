//! Directory-backed supervisor.
//!
//! The full game-server process supervisor is an external collaborator;
//! this default implementation manages server directories under the pool's
//! data root and tails each server's `console.log`. Process lifecycle
//! commands are left to the real supervisor and report as unsupported
//! here.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use garrison_common::{ProviderFault, ServerSupervisor};

const CONSOLE_LOG: &str = "console.log";

pub struct DiskSupervisor {
    root: PathBuf,
}

impl DiskSupervisor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn server_dir(&self, server: &str) -> Result<PathBuf, ProviderFault> {
        if server.is_empty()
            || server.contains('/')
            || server.contains('\\')
            || server.starts_with('.')
        {
            return Err(ProviderFault::Argument(format!(
                "bad server name '{server}'"
            )));
        }
        Ok(self.root.join(server))
    }
}

impl ServerSupervisor for DiskSupervisor {
    fn supports(&self, cmd: &str) -> bool {
        matches!(cmd, "create" | "delete" | "status")
    }

    fn invoke(
        &self,
        server: &str,
        cmd: &str,
        _args: Vec<Value>,
    ) -> Result<Value, ProviderFault> {
        let dir = self.server_dir(server)?;
        match cmd {
            "create" => {
                std::fs::create_dir_all(&dir)
                    .map_err(|e| ProviderFault::Io(format!("create {server}: {e}")))?;
                let log = dir.join(CONSOLE_LOG);
                if !log.is_file() {
                    File::create(&log)
                        .map_err(|e| ProviderFault::Io(format!("console log: {e}")))?;
                }
                Ok(json!(true))
            }
            "delete" => {
                if !dir.is_dir() {
                    return Err(ProviderFault::Validation(format!("no server {server}")));
                }
                std::fs::remove_dir_all(&dir)
                    .map_err(|e| ProviderFault::Io(format!("delete {server}: {e}")))?;
                Ok(json!(true))
            }
            "status" => Ok(json!({ "exists": dir.is_dir() })),
            other => Err(ProviderFault::Validation(format!(
                "{other} is not managed by the disk supervisor"
            ))),
        }
    }

    fn list_servers(&self) -> Result<BTreeSet<String>, ProviderFault> {
        if !self.root.is_dir() {
            return Ok(BTreeSet::new());
        }
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| ProviderFault::Io(format!("list servers: {e}")))?;
        let mut servers = BTreeSet::new();
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                servers.insert(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(servers)
    }

    fn tail_console(
        &self,
        server: &str,
        stop: Arc<AtomicBool>,
    ) -> Result<Box<dyn Iterator<Item = String> + Send>, ProviderFault> {
        let path = self.server_dir(server)?.join(CONSOLE_LOG);
        let mut file =
            File::open(&path).map_err(|e| ProviderFault::Io(format!("open console: {e}")))?;
        // Only lines written after the tail starts are interesting.
        file.seek(SeekFrom::End(0))
            .map_err(|e| ProviderFault::Io(format!("seek console: {e}")))?;
        Ok(Box::new(FileTail {
            reader: BufReader::new(file),
            stop,
        }))
    }
}

struct FileTail {
    reader: BufReader<File>,
    stop: Arc<AtomicBool>,
}

impl Iterator for FileTail {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut line = String::new();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    std::thread::sleep(Duration::from_millis(200));
                }
                Ok(_) => {
                    if line.ends_with('\n') {
                        return Some(line.trim_end_matches(&['\r', '\n'][..]).to_string());
                    }
                    // Partial line: keep accumulating until the newline
                    // lands.
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn create_status_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = DiskSupervisor::new(dir.path());

        sup.invoke("srv1", "create", vec![]).unwrap();
        assert!(sup.list_servers().unwrap().contains("srv1"));
        assert_eq!(
            sup.invoke("srv1", "status", vec![]).unwrap(),
            json!({ "exists": true })
        );

        sup.invoke("srv1", "delete", vec![]).unwrap();
        assert!(sup.list_servers().unwrap().is_empty());
        let err = sup.invoke("srv1", "delete", vec![]).unwrap_err();
        assert_eq!(err.kind_name(), "ValidationError");
    }

    #[test]
    fn lifecycle_commands_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let sup = DiskSupervisor::new(dir.path());
        assert!(sup.supports("create"));
        assert!(!sup.supports("start"));
    }

    #[test]
    fn path_escapes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = DiskSupervisor::new(dir.path());
        for name in ["../evil", "a/b", ".hidden", ""] {
            let err = sup.invoke(name, "create", vec![]).unwrap_err();
            assert_eq!(err.kind_name(), "ArgumentError", "{name}");
        }
    }

    #[test]
    fn tail_sees_lines_appended_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let sup = DiskSupervisor::new(dir.path());
        sup.invoke("srv1", "create", vec![]).unwrap();

        let log = dir.path().join("srv1").join(CONSOLE_LOG);
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            writeln!(f, "before tail").unwrap();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut tail = sup.tail_console("srv1", stop.clone()).unwrap();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            writeln!(f, "after tail").unwrap();
        });

        assert_eq!(tail.next().as_deref(), Some("after tail"));
        writer.join().unwrap();
        stop.store(true, Ordering::SeqCst);
        assert_eq!(tail.next(), None);
    }
}
