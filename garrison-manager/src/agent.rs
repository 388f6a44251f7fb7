//! Per-host directive handling.
//!
//! The manager subscribes `managers.#` so broadcast and targeted
//! directives arrive on one queue, announces itself to HQ at startup and
//! on a heartbeat interval, and answers every directive it recognizes with
//! exactly one receipt. `CONFIRM_SHUTDOWN` with the correct nonce is the
//! only way a message stops this loop.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use garrison_common::{
    is_pool_name, AccountProvisioner, Bus, Envelope, Exchange, MessageKind, ProviderFault,
    RoutingKey, HQ_KEY, MANAGERS_TOPIC,
};

use crate::challenge;

/// Launches a detached worker process for a pool. The production
/// implementation double-forks and drops privileges; tests record calls.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, pool: &str) -> Result<(), ProviderFault>;
}

pub struct ManagerAgent {
    bus: Arc<dyn Bus>,
    hostname: String,
    provisioner: Arc<dyn AccountProvisioner>,
    spawner: Arc<dyn WorkerSpawner>,
    pending_nonce: Mutex<Option<String>>,
    ident_delay: Duration,
    heartbeat: Duration,
}

impl ManagerAgent {
    pub fn new(
        bus: Arc<dyn Bus>,
        hostname: &str,
        provisioner: Arc<dyn AccountProvisioner>,
        spawner: Arc<dyn WorkerSpawner>,
        ident_delay: Duration,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            hostname: hostname.to_ascii_lowercase(),
            provisioner,
            spawner,
            pending_nonce: Mutex::new(None),
            ident_delay,
            heartbeat,
        })
    }

    /// Drive the directive loop until a confirmed shutdown stops it.
    /// Workers this manager spawned are left running.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let own_key = RoutingKey::manager(&self.hostname).to_string();
        let mut rx = self
            .bus
            .subscribe(Exchange::Backend, &format!("{MANAGERS_TOPIC}.#"))
            .await?;

        self.announce().await;
        let heartbeat = {
            let agent = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(agent.heartbeat);
                interval.tick().await; // the startup announce covered this one
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
            // The wildcard queue sees every manager's traffic; act only on
            // broadcasts and messages addressed here.
            if envelope.routing_key != MANAGERS_TOPIC && envelope.routing_key != own_key {
                continue;
            }
            if let ControlFlow::Break(()) = self.handle_directive(envelope).await {
                break;
            }
        }

        heartbeat.abort();
        info!(host = %self.hostname, "manager loop stopped");
        Ok(())
    }

    pub async fn announce(&self) {
        let envelope = Envelope::new(
            MessageKind::Init,
            HQ_KEY,
            json!({ "hostname": self.hostname }),
        )
        .with_header("directive", "IDENT")
        .with_header("hostname", self.hostname.as_str());
        if let Err(e) = self.bus.publish(Exchange::Backend, HQ_KEY, envelope).await {
            warn!("IDENT announce failed: {e}");
        }
    }

    async fn handle_directive(self: &Arc<Self>, envelope: Envelope) -> ControlFlow<()> {
        let directive = envelope.header_str("directive").unwrap_or("").to_string();
        debug!(%directive, from = %envelope.routing_key, "manager directive");

        let (reply, halt) = match directive.as_str() {
            "IDENT" => (self.ident(&envelope).await, false),
            "READY_SHUTDOWN" => (self.ready_shutdown(&envelope).await, false),
            "CONFIRM_SHUTDOWN" => self.confirm_shutdown(&envelope).await,
            "MKPOOL" => (self.mkpool(&envelope).await, false),
            "SPAWN" => (self.spawn_worker(&envelope).await, false),
            "REMOVE" => (self.remove_pool(&envelope).await, false),
            _ => (
                envelope
                    .reply(MessageKind::ReceiptDirective, json!({}))
                    .with_header("directive", "BOGUS"),
                false,
            ),
        };

        if let Err(e) = self.bus.publish(Exchange::Backend, HQ_KEY, reply).await {
            warn!(%directive, "receipt publish failed: {e}");
        }
        if halt {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Debounced probe reply: simultaneous IDENT probes from HQ spread out
    /// over a short window.
    async fn ident(&self, envelope: &Envelope) -> Envelope {
        let jitter = rand::thread_rng().gen_range(0..=self.ident_delay.as_millis() as u64);
        tokio::time::sleep(self.ident_delay + Duration::from_millis(jitter)).await;
        envelope
            .reply(
                MessageKind::ReceiptDirective,
                json!({ "hostname": self.hostname }),
            )
            .with_header("directive", "IDENT")
    }

    /// Seal a fresh timestamp nonce to the supplied public key and
    /// remember the plaintext for the confirmation round.
    async fn ready_shutdown(&self, envelope: &Envelope) -> Envelope {
        let Some(pubkey) = envelope.payload.get("pubkey").and_then(Value::as_str) else {
            return envelope
                .reply(
                    MessageKind::ReceiptDirective,
                    json!({ "ok": false, "error": "missing pubkey" }),
                )
                .with_header("directive", "READY_SHUTDOWN");
        };

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();

        match challenge::seal(pubkey, &nonce) {
            Ok(sealed) => {
                *self.pending_nonce.lock().await = Some(nonce);
                info!(host = %self.hostname, "shutdown challenge issued");
                envelope
                    .reply(
                        MessageKind::ReceiptDirective,
                        json!({ "ok": true, "challenge": sealed }),
                    )
                    .with_header("directive", "READY_SHUTDOWN")
            }
            Err(e) => {
                warn!("refusing shutdown challenge: {e}");
                *self.pending_nonce.lock().await = None;
                envelope
                    .reply(
                        MessageKind::ReceiptDirective,
                        json!({ "ok": false, "error": e.to_string() }),
                    )
                    .with_header("directive", "READY_SHUTDOWN")
            }
        }
    }

    /// Compare the echoed value with the remembered nonce. Any outcome
    /// consumes the nonce: a wrong or replayed confirmation invalidates
    /// the outstanding challenge and a fresh READY_SHUTDOWN is required.
    async fn confirm_shutdown(&self, envelope: &Envelope) -> (Envelope, bool) {
        let value = envelope.payload.get("value").and_then(Value::as_str);
        let remembered = self.pending_nonce.lock().await.take();

        let matches = match (value, remembered) {
            (Some(v), Some(nonce)) => v == nonce,
            _ => false,
        };
        if matches {
            info!(host = %self.hostname, "shutdown confirmed");
        } else {
            warn!(host = %self.hostname, "shutdown confirmation rejected, challenge cleared");
        }
        (
            envelope
                .reply(
                    MessageKind::ReceiptDirective,
                    json!({ "ok": matches, "halting": matches }),
                )
                .with_header("directive", "CONFIRM_SHUTDOWN"),
            matches,
        )
    }

    /// Create the pool account, then verify it shows up in the
    /// provisioner's own listing. Malformed names never reach the
    /// provisioner.
    async fn mkpool(&self, envelope: &Envelope) -> Envelope {
        let Some(pool) = valid_pool(envelope) else {
            warn!("MKPOOL with malformed pool name refused");
            return pool_receipt(envelope, "MKPOOL", false, Some("invalid pool name"));
        };

        let password: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();

        let provisioner = self.provisioner.clone();
        let name = pool.clone();
        let created = spawn_blocking(move || -> Result<bool, ProviderFault> {
            if !provisioner.create_pool(&name, &password)? {
                return Ok(false);
            }
            Ok(provisioner.list_pools()?.contains(&name))
        })
        .await
        .unwrap_or(Err(ProviderFault::Io("provisioner task died".into())));

        match created {
            Ok(true) => {
                info!(%pool, "pool created and verified");
                pool_receipt(envelope, "MKPOOL", true, None)
            }
            Ok(false) => {
                warn!(%pool, "pool creation failed or not visible in listing");
                pool_receipt(envelope, "MKPOOL", false, Some("pool not created"))
            }
            Err(e) => {
                warn!(%pool, "pool creation faulted: {e}");
                pool_receipt(envelope, "MKPOOL", false, Some(&e.to_string()))
            }
        }
    }

    async fn spawn_worker(&self, envelope: &Envelope) -> Envelope {
        let Some(pool) = valid_pool(envelope) else {
            warn!("SPAWN with malformed pool name refused");
            return pool_receipt(envelope, "SPAWN", false, Some("invalid pool name"));
        };

        let spawner = self.spawner.clone();
        let name = pool.clone();
        let spawned = spawn_blocking(move || spawner.spawn(&name))
            .await
            .unwrap_or(Err(ProviderFault::Io("spawn task died".into())));

        match spawned {
            Ok(()) => {
                info!(%pool, "worker spawned");
                pool_receipt(envelope, "SPAWN", true, None)
            }
            Err(e) => {
                warn!(%pool, "worker spawn failed: {e}");
                pool_receipt(envelope, "SPAWN", false, Some(&e.to_string()))
            }
        }
    }

    async fn remove_pool(&self, envelope: &Envelope) -> Envelope {
        let Some(pool) = valid_pool(envelope) else {
            warn!("REMOVE with malformed pool name refused");
            return pool_receipt(envelope, "REMOVE", false, Some("invalid pool name"));
        };

        let provisioner = self.provisioner.clone();
        let name = pool.clone();
        let removed = spawn_blocking(move || provisioner.remove_pool(&name))
            .await
            .unwrap_or(Err(ProviderFault::Io("provisioner task died".into())));

        match removed {
            Ok(ok) => {
                info!(%pool, ok, "pool removal finished");
                pool_receipt(envelope, "REMOVE", ok, None)
            }
            Err(e) => {
                warn!(%pool, "pool removal faulted: {e}");
                pool_receipt(envelope, "REMOVE", false, Some(&e.to_string()))
            }
        }
    }
}

fn valid_pool(envelope: &Envelope) -> Option<String> {
    envelope
        .payload
        .get("workerpool")
        .and_then(Value::as_str)
        .filter(|name| is_pool_name(name))
        .map(str::to_string)
}

fn pool_receipt(envelope: &Envelope, directive: &str, ok: bool, error: Option<&str>) -> Envelope {
    let mut payload = json!({ "ok": ok });
    if let Some(detail) = error {
        payload["error"] = json!(detail);
    }
    envelope
        .reply(MessageKind::ReceiptDirective, payload)
        .with_header("directive", directive)
}
