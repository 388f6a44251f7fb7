//! Per-server in-memory handles.
//!
//! Each handle owns at most one background console-tail task, created
//! lazily on the first command that touches the server. The tail reads the
//! supervisor's blocking line stream on the blocking pool and republishes
//! every line to the stdout exchange tagged with the server fqdn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use garrison_common::{Bus, Envelope, Exchange, MessageKind, ServerSupervisor, STDOUT_KEY};

pub struct ServerHandle {
    name: String,
    console: Option<ConsoleTask>,
}

struct ConsoleTask {
    stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    publisher: JoinHandle<()>,
}

impl ServerHandle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            console: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn console_running(&self) -> bool {
        self.console.is_some()
    }

    /// Start the console tail if it is not already running.
    pub fn ensure_console(
        &mut self,
        bus: Arc<dyn Bus>,
        supervisor: Arc<dyn ServerSupervisor>,
        fqdn: String,
    ) {
        if self.console.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let tail = match supervisor.tail_console(&self.name, stop.clone()) {
            Ok(tail) => tail,
            Err(e) => {
                // Stays unset; the next command retries.
                warn!(server = %self.name, "console tail unavailable: {e}");
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = tokio::task::spawn_blocking(move || {
            let mut tail = tail;
            for line in tail.by_ref() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let publisher = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let envelope = Envelope::new(MessageKind::Receipt, STDOUT_KEY, json!(line))
                    .with_header("server", fqdn.as_str());
                if let Err(e) = bus.publish(Exchange::Stdout, STDOUT_KEY, envelope).await {
                    warn!(server = %fqdn, "console publish failed: {e}");
                }
            }
        });

        debug!(server = %self.name, "console tail started");
        self.console = Some(ConsoleTask {
            stop,
            reader,
            publisher,
        });
    }

    /// Signal the tail to stop and join it with a short grace timeout.
    pub async fn teardown(self) {
        let Some(console) = self.console else {
            return;
        };
        console.stop.store(true, Ordering::SeqCst);
        if tokio::time::timeout(Duration::from_secs(2), console.reader)
            .await
            .is_err()
        {
            warn!(server = %self.name, "console reader did not stop in time");
        }
        // The publisher drains whatever the reader already produced and
        // ends when the channel closes.
        if tokio::time::timeout(Duration::from_secs(2), console.publisher)
            .await
            .is_err()
        {
            warn!(server = %self.name, "console publisher did not stop in time");
        }
    }
}
