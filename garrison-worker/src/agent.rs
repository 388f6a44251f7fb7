//! Per-pool directive and command handling.
//!
//! The worker subscribes `workers.#` so broadcast and targeted traffic
//! arrive on one queue, announces its pool to HQ at startup and on a
//! heartbeat interval, and answers every directive and command with
//! exactly one receipt. Supervisor invocations run per-call on the
//! blocking pool, so replies for different servers may complete out of
//! order; correlation ids carry the pairing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use garrison_common::{
    Bus, Envelope, Exchange, MessageKind, ObjectStore, ObjectStoreCreds, ProviderFault,
    RoutingKey, ServerSupervisor, HQ_KEY, WORKERS_TOPIC,
};

use crate::commands;
use crate::handle::ServerHandle;
use crate::usage;

pub struct WorkerAgent {
    bus: Arc<dyn Bus>,
    hostname: String,
    pool: String,
    supervisor: Arc<dyn ServerSupervisor>,
    objstore: Arc<dyn ObjectStore>,
    handles: Mutex<HashMap<String, ServerHandle>>,
    heartbeat: Duration,
}

impl WorkerAgent {
    pub fn new(
        bus: Arc<dyn Bus>,
        hostname: &str,
        pool: &str,
        supervisor: Arc<dyn ServerSupervisor>,
        objstore: Arc<dyn ObjectStore>,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            hostname: hostname.to_ascii_lowercase(),
            pool: pool.to_ascii_lowercase(),
            supervisor,
            objstore,
            handles: Mutex::new(HashMap::new()),
            heartbeat,
        })
    }

    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        // Build the inventory from what already exists on disk.
        let supervisor = self.supervisor.clone();
        let servers = spawn_blocking(move || supervisor.list_servers()).await??;
        {
            let mut handles = self.handles.lock().await;
            for server in &servers {
                handles.insert(server.clone(), ServerHandle::new(server));
            }
        }
        info!(
            host = %self.hostname,
            pool = %self.pool,
            servers = servers.len(),
            "worker inventory ready"
        );

        let own_key = RoutingKey::worker(&self.hostname, &self.pool).to_string();
        let mut rx = self
            .bus
            .subscribe(Exchange::Backend, &format!("{WORKERS_TOPIC}.#"))
            .await?;

        self.announce().await;
        let heartbeat = {
            let agent = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(agent.heartbeat);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    agent.announce().await;
                }
            })
        };

        while let Some(envelope) = rx.recv().await {
            if envelope.kind.is_receipt() {
                continue;
            }
            if envelope.routing_key != WORKERS_TOPIC && envelope.routing_key != own_key {
                continue;
            }
            match envelope.kind {
                MessageKind::Directive | MessageKind::Init => {
                    self.handle_directive(envelope).await;
                }
                MessageKind::Command => {
                    self.handle_command(envelope).await;
                }
                _ => {}
            }
        }

        heartbeat.abort();
        Ok(())
    }

    pub async fn announce(&self) {
        let envelope = Envelope::new(
            MessageKind::Init,
            HQ_KEY,
            json!({ "hostname": self.hostname, "workerpool": self.pool }),
        )
        .with_header("directive", "IDENT")
        .with_header("hostname", self.hostname.as_str())
        .with_header("workerpool", self.pool.as_str());
        if let Err(e) = self.bus.publish(Exchange::Backend, HQ_KEY, envelope).await {
            warn!("IDENT announce failed: {e}");
        }
    }

    async fn publish_reply(&self, reply: Envelope) {
        if let Err(e) = self.bus.publish(Exchange::Backend, HQ_KEY, reply).await {
            warn!("receipt publish failed: {e}");
        }
    }

    // --- directives ---------------------------------------------------------

    /// Every directive gets exactly one reply; unrecognized ones are
    /// answered BOGUS rather than silently dropped.
    async fn handle_directive(self: &Arc<Self>, envelope: Envelope) {
        let directive = envelope.header_str("directive").unwrap_or("").to_string();
        debug!(%directive, from = %envelope.routing_key, "worker directive");

        match directive.as_str() {
            "IDENT" => {
                let reply = envelope
                    .reply(
                        MessageKind::ReceiptDirective,
                        json!({ "hostname": self.hostname, "workerpool": self.pool }),
                    )
                    .with_header("directive", "IDENT");
                self.publish_reply(reply).await;
            }
            "LIST" => {
                let servers: Vec<String> = {
                    let handles = self.handles.lock().await;
                    let mut names: Vec<String> =
                        handles.keys().cloned().collect();
                    names.sort();
                    names
                };
                let reply = envelope
                    .reply(
                        MessageKind::ReceiptDirective,
                        json!({ "servers": servers }),
                    )
                    .with_header("directive", "LIST");
                self.publish_reply(reply).await;
            }
            "USAGE" => {
                // Sampling blocks; keep it off the loop and reply from the
                // task so other traffic keeps flowing.
                let agent = self.clone();
                tokio::spawn(async move {
                    let snapshot = spawn_blocking(usage::sample)
                        .await
                        .unwrap_or_else(|_| json!({}));
                    let reply = envelope
                        .reply(MessageKind::ReceiptDirective, snapshot)
                        .with_header("directive", "USAGE");
                    agent.publish_reply(reply).await;
                });
            }
            name if usage::is_metric(name) => {
                let agent = self.clone();
                let metric = name.to_ascii_lowercase();
                tokio::spawn(async move {
                    let value = {
                        let metric = metric.clone();
                        spawn_blocking(move || usage::sample_metric(&metric))
                            .await
                            .ok()
                            .flatten()
                            .unwrap_or(Value::Null)
                    };
                    let reply = envelope
                        .reply(MessageKind::ReceiptDirective, json!({ metric.as_str(): value }))
                        .with_header("directive", metric.to_ascii_uppercase().as_str());
                    agent.publish_reply(reply).await;
                });
            }
            "VERIFY_OBJSTORE" => {
                // An empty payload tells HQ no credentials are configured
                // here; it answers with an AWSCREDS push.
                let payload = match self.objstore.credentials() {
                    Some(creds) => json!({
                        "endpoint": creds.endpoint,
                        "region": creds.region,
                    }),
                    None => json!({}),
                };
                let reply = envelope
                    .reply(MessageKind::ReceiptDirective, payload)
                    .with_header("directive", "VERIFY_OBJSTORE");
                self.publish_reply(reply).await;
            }
            "AWSCREDS" => {
                let agent = self.clone();
                tokio::spawn(async move {
                    let reply = agent.apply_objstore_creds(&envelope).await;
                    agent.publish_reply(reply).await;
                });
            }
            _ => {
                let reply = envelope
                    .reply(MessageKind::ReceiptDirective, json!({}))
                    .with_header("directive", "BOGUS");
                self.publish_reply(reply).await;
            }
        }
    }

    async fn apply_objstore_creds(&self, envelope: &Envelope) -> Envelope {
        let creds: ObjectStoreCreds = match serde_json::from_value(envelope.payload.clone()) {
            Ok(creds) => creds,
            Err(e) => {
                warn!("malformed AWSCREDS payload: {e}");
                return envelope
                    .reply(
                        MessageKind::ReceiptDirective,
                        json!({ "ok": false, "error": "malformed credentials" }),
                    )
                    .with_header("directive", "AWSCREDS");
            }
        };

        let objstore = self.objstore.clone();
        let applied = spawn_blocking(move || objstore.configure(creds))
            .await
            .unwrap_or(Err(ProviderFault::Io("objstore task died".into())));

        let payload = match applied {
            Ok(()) => {
                info!("object-store credentials applied");
                json!({ "ok": true })
            }
            Err(e) => {
                warn!("object-store client establishment failed: {e}");
                json!({ "ok": false, "error": e.to_string() })
            }
        };
        envelope
            .reply(MessageKind::ReceiptDirective, payload)
            .with_header("directive", "AWSCREDS")
    }

    // --- commands -----------------------------------------------------------

    async fn handle_command(self: &Arc<Self>, envelope: Envelope) {
        let Some(server) = envelope.header_str("server").map(str::to_string) else {
            warn!("discarding command without server header");
            return;
        };
        let Some(cmd) = envelope.header_str("command").map(str::to_string) else {
            warn!(%server, "discarding command without command header");
            return;
        };
        debug!(%server, %cmd, "worker command");

        // First command for a server materializes its handle and console.
        {
            let fqdn = format!("{}.{}.{}", self.hostname, self.pool, server);
            let mut handles = self.handles.lock().await;
            let handle = handles
                .entry(server.clone())
                .or_insert_with(|| ServerHandle::new(&server));
            handle.ensure_console(self.bus.clone(), self.supervisor.clone(), fqdn);
        }

        let Some(spec) = commands::lookup(&cmd) else {
            let reply = not_found_reply(&envelope, &server, &cmd, "no such command");
            self.publish_reply(reply).await;
            return;
        };
        if !self.supervisor.supports(&cmd) {
            let reply = not_found_reply(&envelope, &server, &cmd, "unsupported by supervisor");
            self.publish_reply(reply).await;
            return;
        }
        let args = match commands::extract_args(spec, &envelope.payload) {
            Ok(args) => args,
            Err(fault) => {
                let reply = fault_reply(&envelope, &server, &cmd, &fault);
                self.publish_reply(reply).await;
                return;
            }
        };

        // Per-call offload: two commands for different servers may finish
        // out of order.
        let agent = self.clone();
        tokio::spawn(async move {
            let supervisor = agent.supervisor.clone();
            let invoke_server = server.clone();
            let invoke_cmd = cmd.clone();
            let outcome =
                spawn_blocking(move || supervisor.invoke(&invoke_server, &invoke_cmd, args))
                    .await
                    .unwrap_or(Err(ProviderFault::Io("supervisor task died".into())));

            let reply = match outcome {
                Ok(retval) => {
                    if cmd == "delete" {
                        agent.drop_handle(&server).await;
                    }
                    envelope
                        .reply(
                            MessageKind::ReceiptCommand,
                            json!({
                                "server_name": server,
                                "cmd": cmd,
                                "success": true,
                                "retval": retval,
                            }),
                        )
                        .with_header("command", cmd.as_str())
                }
                Err(fault) => fault_reply(&envelope, &server, &cmd, &fault),
            };
            agent.publish_reply(reply).await;
        });
    }

    async fn drop_handle(&self, server: &str) {
        let removed = self.handles.lock().await.remove(server);
        if let Some(handle) = removed {
            handle.teardown().await;
            info!(server, "server handle torn down");
        }
    }

    pub async fn handle_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}

fn not_found_reply(envelope: &Envelope, server: &str, cmd: &str, detail: &str) -> Envelope {
    envelope
        .reply(
            MessageKind::ReceiptCommand,
            json!({ "server_name": server, "cmd": cmd, "success": false }),
        )
        .with_header("command", cmd)
        .with_header(
            "exception",
            json!({ "name": "NotFound", "detail": detail }),
        )
}

fn fault_reply(envelope: &Envelope, server: &str, cmd: &str, fault: &ProviderFault) -> Envelope {
    envelope
        .reply(
            MessageKind::ReceiptCommand,
            json!({ "server_name": server, "cmd": cmd, "success": false }),
        )
        .with_header("command", cmd)
        .with_header(
            "exception",
            json!({ "name": fault.kind_name(), "detail": fault.to_string() }),
        )
}
