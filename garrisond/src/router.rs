//! HQ request routing.
//!
//! Each operator request walks `received → authorized → forwarded →
//! awaiting-reply → replied` (or stops at `rejected`): the router permission
//! checks the request, verifies the target satellite has registered,
//! forwards the message over the bus and registers a promise that streams
//! the eventual receipt back to the originating operator session. Console
//! output from workers is fanned out to every session whose screen grants
//! the `console` permission.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use garrison_common::{
    is_pool_name, Bus, Envelope, Exchange, MessageKind, ObjectStoreCreds, PermissionStore,
    PromiseTable, Receipt, ReceiptStatus, RoutingKey, SatelliteRegistry, ScreenKey, HQ_KEY,
    MANAGERS_TOPIC, STDOUT_KEY, WORKERS_TOPIC,
};

/// Directives HQ will forward to a manager.
const MANAGER_DIRECTIVES: &[&str] = &[
    "MKPOOL",
    "SPAWN",
    "REMOVE",
    "READY_SHUTDOWN",
    "CONFIRM_SHUTDOWN",
];

/// Directives HQ will forward to a worker.
const WORKER_DIRECTIVES: &[&str] = &["LIST", "USAGE", "CPU", "MEM", "LOAD", "DISK"];

pub struct OperatorSession {
    pub user: String,
    pub tx: mpsc::UnboundedSender<Value>,
}

/// Screen bookkeeping applied when a forwarded call's receipt comes back
/// successful: scope lifecycle is tied 1:1 to the lifecycle of the real
/// resource.
enum PostAction {
    CreatePoolScreen {
        host: String,
        pool: String,
        owner: String,
    },
    RemovePoolScreen {
        host: String,
        pool: String,
    },
    RemoveServerScreen {
        key: ScreenKey,
    },
}

pub struct RouterState {
    pub store: PermissionStore,
    pub registry: SatelliteRegistry,
    pub promises: PromiseTable,
    sessions: HashMap<String, OperatorSession>,
    post_actions: HashMap<String, PostAction>,
}

pub struct Router {
    bus: Arc<dyn Bus>,
    state: Arc<Mutex<RouterState>>,
    objstore: Option<ObjectStoreCreds>,
    snapshot: Option<PathBuf>,
}

impl Router {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: PermissionStore,
        objstore: Option<ObjectStoreCreds>,
        snapshot: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: Arc::new(Mutex::new(RouterState {
                store,
                registry: SatelliteRegistry::new(),
                promises: PromiseTable::new(),
                sessions: HashMap::new(),
                post_actions: HashMap::new(),
            })),
            objstore,
            snapshot,
        })
    }

    pub fn state(&self) -> Arc<Mutex<RouterState>> {
        self.state.clone()
    }

    /// Bind the HQ queues, announce IDENT to both satellite topics and
    /// start the inbound pumps.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let backend = self.bus.subscribe(Exchange::Backend, HQ_KEY).await?;
        let console = self.bus.subscribe(Exchange::Stdout, STDOUT_KEY).await?;

        self.broadcast_ident().await;

        let router = self.clone();
        tokio::spawn(async move {
            let mut backend = backend;
            while let Some(envelope) = backend.recv().await {
                router.handle_inbound(envelope).await;
            }
        });

        let router = self.clone();
        tokio::spawn(async move {
            let mut console = console;
            while let Some(envelope) = console.recv().await {
                router.fan_out_console(envelope).await;
            }
        });

        Ok(())
    }

    pub async fn broadcast_ident(&self) {
        for topic in [WORKERS_TOPIC, MANAGERS_TOPIC] {
            let envelope = Envelope::new(MessageKind::Init, topic, Value::Null)
                .with_header("directive", "IDENT");
            if let Err(e) = self.bus.publish(Exchange::Backend, topic, envelope).await {
                warn!(topic, "IDENT broadcast failed: {e}");
            }
        }
    }

    // --- operator sessions ------------------------------------------------

    pub async fn attach_session(
        &self,
        user: &str,
    ) -> (String, mpsc::UnboundedReceiver<Value>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.sessions.insert(
            id.clone(),
            OperatorSession {
                user: user.to_string(),
                tx,
            },
        );
        info!(session = %id, user, "operator session attached");
        (id, rx)
    }

    pub async fn detach_session(&self, id: &str) {
        let mut state = self.state.lock().await;
        if state.sessions.remove(id).is_some() {
            info!(session = %id, "operator session detached");
        }
    }

    // --- request entry point ----------------------------------------------

    pub async fn handle_request(self: &Arc<Self>, session_id: &str, request: Value) {
        let (user, tx) = {
            let state = self.state.lock().await;
            match state.sessions.get(session_id) {
                Some(s) => (s.user.clone(), s.tx.clone()),
                None => {
                    warn!(session = session_id, "request from unknown session");
                    return;
                }
            }
        };
        let request_id = request
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);

        match request.get("request").and_then(Value::as_str) {
            Some("command") => {
                self.handle_command(&user, &tx, request_id, &request).await;
            }
            Some("directive") => {
                self.handle_directive(&user, &tx, request_id, &request).await;
            }
            Some(op @ ("grant" | "revoke" | "make_grantor" | "unmake_grantor")) => {
                self.handle_perm(&user, &tx, request_id, op, &request).await;
            }
            other => {
                debug!(%user, request = ?other, "unknown request shape");
                send_error(&tx, request_id, "validation", "unknown request");
            }
        }
    }

    // --- server-scoped commands -------------------------------------------

    async fn handle_command(
        self: &Arc<Self>,
        user: &str,
        tx: &mpsc::UnboundedSender<Value>,
        request_id: Option<String>,
        request: &Value,
    ) {
        let target = request.get("target").and_then(Value::as_str).unwrap_or("");
        let command = request.get("command").and_then(Value::as_str).unwrap_or("");
        let args = request.get("args").cloned().unwrap_or_else(|| json!({}));

        let key = match ScreenKey::parse(target) {
            Ok(key @ ScreenKey::Server { .. }) => key,
            _ => {
                send_error(tx, request_id, "validation", "command target must be host.pool.server");
                return;
            }
        };
        let ScreenKey::Server { host, pool, server } = &key else {
            unreachable!()
        };
        // A pool account must never be addressable as if it were a server.
        if is_pool_name(server) {
            warn!(user, target, "command target matches the pool-name pattern");
            send_error(tx, request_id, "validation", "target names a pool, not a server");
            return;
        }

        let worker_key = RoutingKey::worker(host, pool).to_string();
        let mut state = self.state.lock().await;
        if !state.registry.is_registered(&worker_key) {
            info!(user, worker = %worker_key, command, "dropping command for unregistered worker");
            return;
        }

        if !state.store.contains(&key) {
            if command == "create" {
                // First touch of a fresh fqdn: the creator becomes the
                // screen's owner with `all`.
                if let Err(e) = state.store.create_screen(key.clone(), user) {
                    warn!(user, screen = %key, "screen synthesis failed: {e}");
                    return;
                }
                self.maybe_flush(&state.store);
            } else {
                info!(user, screen = %key, command, "dropping command for unknown server");
                return;
            }
        } else {
            match state.store.test_permission(&key, user, command) {
                Ok(true) => {}
                Ok(false) => {
                    // No reply on a failed permission check: a reply would
                    // confirm to an unauthorized prober that the scope
                    // exists. Intentional, not an oversight.
                    info!(user, screen = %key, command, "unauthorized command dropped");
                    return;
                }
                Err(e) => {
                    warn!(user, screen = %key, "permission lookup failed: {e}");
                    return;
                }
            }
        }

        let envelope = Envelope::new(MessageKind::Command, &worker_key, args)
            .with_header("hostname", host.as_str())
            .with_header("workerpool", pool.as_str())
            .with_header("server", server.as_str())
            .with_header("command", command);

        if command == "delete" {
            state.post_actions.insert(
                envelope.message_id.clone(),
                PostAction::RemoveServerScreen { key: key.clone() },
            );
        }

        let reply_tx = tx.clone();
        let reply_target = target.to_string();
        let reply_command = command.to_string();
        state
            .promises
            .register_call(&envelope.message_id, move |receipt| {
                send_receipt(
                    &reply_tx,
                    "receipt.command",
                    request_id,
                    json!({ "target": reply_target, "command": reply_command }),
                    receipt,
                );
            });
        drop(state);

        info!(user, worker = %worker_key, command, "command forwarded");
        self.publish_or_fail(Exchange::Backend, &worker_key, envelope)
            .await;
    }

    // --- directives --------------------------------------------------------

    async fn handle_directive(
        self: &Arc<Self>,
        user: &str,
        tx: &mpsc::UnboundedSender<Value>,
        request_id: Option<String>,
        request: &Value,
    ) {
        let directive = request
            .get("directive")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_uppercase();
        let host = request
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        if host.is_empty() {
            send_error(tx, request_id, "validation", "directive needs a host");
            return;
        }

        if MANAGER_DIRECTIVES.contains(&directive.as_str()) {
            self.manager_directive(user, tx, request_id, &host, &directive, request)
                .await;
        } else if WORKER_DIRECTIVES.contains(&directive.as_str()) {
            self.worker_directive(user, tx, request_id, &host, &directive, request)
                .await;
        } else {
            send_error(tx, request_id, "validation", "unknown directive");
        }
    }

    async fn manager_directive(
        self: &Arc<Self>,
        user: &str,
        tx: &mpsc::UnboundedSender<Value>,
        request_id: Option<String>,
        host: &str,
        directive: &str,
        request: &Value,
    ) {
        let workerpool = request
            .get("workerpool")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();

        // Pool lifecycle and spawn need a pool name; the shutdown pair does
        // not.
        let needs_pool = matches!(directive, "MKPOOL" | "SPAWN" | "REMOVE");
        if needs_pool && !is_pool_name(&workerpool) {
            warn!(user, %workerpool, directive, "rejecting malformed pool name");
            send_error(tx, request_id, "validation", "workerpool violates the pool-name pattern");
            return;
        }

        // MKPOOL concerns a pool that does not exist yet and the shutdown
        // pair concerns the whole host: both are gated by the root screen.
        // SPAWN/REMOVE are gated by the pool's own screen.
        let (screen, perm) = match directive {
            "MKPOOL" => (ScreenKey::Root, "mkpool".to_string()),
            "READY_SHUTDOWN" | "CONFIRM_SHUTDOWN" => (ScreenKey::Root, "shutdown".to_string()),
            _ => (
                ScreenKey::pool(host, &workerpool),
                directive.to_ascii_lowercase(),
            ),
        };

        let manager_key = RoutingKey::manager(host).to_string();
        let mut state = self.state.lock().await;
        match state.store.test_permission(&screen, user, &perm) {
            Ok(true) => {}
            Ok(false) => {
                // Silent drop, same reasoning as the command path.
                info!(user, screen = %screen, directive, "unauthorized directive dropped");
                return;
            }
            Err(e) => {
                info!(user, screen = %screen, directive, "directive for unknown scope: {e}");
                return;
            }
        }
        if !state.registry.is_registered(&manager_key) {
            info!(user, manager = %manager_key, directive, "dropping directive for unregistered manager");
            return;
        }

        let mut payload = Map::new();
        if needs_pool {
            payload.insert("workerpool".to_string(), json!(workerpool));
        }
        if directive == "READY_SHUTDOWN" {
            let Some(pubkey) = request.get("pubkey").and_then(Value::as_str) else {
                send_error(tx, request_id, "validation", "READY_SHUTDOWN needs a pubkey");
                return;
            };
            payload.insert("pubkey".to_string(), json!(pubkey));
        }
        if directive == "CONFIRM_SHUTDOWN" {
            let Some(value) = request.get("value").and_then(Value::as_str) else {
                send_error(tx, request_id, "validation", "CONFIRM_SHUTDOWN needs a value");
                return;
            };
            payload.insert("value".to_string(), json!(value));
        }

        let envelope = Envelope::new(
            MessageKind::Directive,
            &manager_key,
            Value::Object(payload),
        )
        .with_header("directive", directive)
        .with_header("hostname", host);

        match directive {
            "MKPOOL" => {
                state.post_actions.insert(
                    envelope.message_id.clone(),
                    PostAction::CreatePoolScreen {
                        host: host.to_string(),
                        pool: workerpool.clone(),
                        owner: user.to_string(),
                    },
                );
            }
            "REMOVE" => {
                state.post_actions.insert(
                    envelope.message_id.clone(),
                    PostAction::RemovePoolScreen {
                        host: host.to_string(),
                        pool: workerpool.clone(),
                    },
                );
            }
            _ => {}
        }

        let reply_tx = tx.clone();
        let echo = json!({ "host": host, "directive": directive });
        state
            .promises
            .register_call(&envelope.message_id, move |receipt| {
                send_receipt(&reply_tx, "receipt.directive", request_id, echo, receipt);
            });
        drop(state);

        info!(user, manager = %manager_key, directive, "directive forwarded");
        self.publish_or_fail(Exchange::Backend, &manager_key, envelope)
            .await;
    }

    async fn worker_directive(
        self: &Arc<Self>,
        user: &str,
        tx: &mpsc::UnboundedSender<Value>,
        request_id: Option<String>,
        host: &str,
        directive: &str,
        request: &Value,
    ) {
        let pool = request
            .get("pool")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        if pool.is_empty() {
            send_error(tx, request_id, "validation", "worker directive needs a pool");
            return;
        }

        let screen = ScreenKey::pool(host, &pool);
        let worker_key = RoutingKey::worker(host, &pool).to_string();
        let mut state = self.state.lock().await;
        match state
            .store
            .test_permission(&screen, user, &directive.to_ascii_lowercase())
        {
            Ok(true) => {}
            Ok(false) => {
                info!(user, screen = %screen, directive, "unauthorized directive dropped");
                return;
            }
            Err(e) => {
                info!(user, screen = %screen, directive, "directive for unknown pool: {e}");
                return;
            }
        }
        if !state.registry.is_registered(&worker_key) {
            info!(user, worker = %worker_key, directive, "dropping directive for unregistered worker");
            return;
        }

        let envelope = Envelope::new(MessageKind::Directive, &worker_key, Value::Null)
            .with_header("directive", directive)
            .with_header("hostname", host)
            .with_header("workerpool", pool.as_str());

        let reply_tx = tx.clone();
        let echo = json!({ "host": host, "pool": pool, "directive": directive });
        state
            .promises
            .register_call(&envelope.message_id, move |receipt| {
                send_receipt(&reply_tx, "receipt.directive", request_id, echo, receipt);
            });
        drop(state);

        self.publish_or_fail(Exchange::Backend, &worker_key, envelope)
            .await;
    }

    // --- permission management ---------------------------------------------

    async fn handle_perm(
        self: &Arc<Self>,
        user: &str,
        tx: &mpsc::UnboundedSender<Value>,
        request_id: Option<String>,
        op: &str,
        request: &Value,
    ) {
        let raw_screen = request.get("screen").and_then(Value::as_str).unwrap_or("");
        let subject = request.get("user").and_then(Value::as_str).unwrap_or("");
        let perm = request.get("perm").and_then(Value::as_str).unwrap_or("");

        let key = match ScreenKey::parse(raw_screen) {
            Ok(key) => key,
            Err(_) => {
                send_error(tx, request_id, "validation", "malformed screen");
                return;
            }
        };
        if subject.is_empty() || (matches!(op, "grant" | "revoke") && perm.is_empty()) {
            send_error(tx, request_id, "validation", "missing user or perm");
            return;
        }

        let mut state = self.state.lock().await;
        let applied = match op {
            "grant" => state.store.grant(&key, user, subject, perm),
            "revoke" => state.store.revoke(&key, user, subject, perm),
            "make_grantor" => state.store.make_grantor(&key, user, subject),
            "unmake_grantor" => state.store.unmake_grantor(&key, user, subject),
            _ => unreachable!(),
        };
        match applied {
            Ok(true) => {
                self.maybe_flush(&state.store);
                let _ = tx.send(json!({
                    "type": "receipt",
                    "request_id": request_id,
                    "status": "ok",
                    "payload": { "op": op, "screen": key.to_string(), "user": subject },
                }));
            }
            // The store already logged the refusal; the actor gets nothing
            // back, like any other failed permission check.
            Ok(false) => {}
            Err(e) => {
                info!(user, screen = %key, op, "permission request dropped: {e}");
            }
        }
    }

    // --- inbound bus traffic ------------------------------------------------

    async fn handle_inbound(self: &Arc<Self>, envelope: Envelope) {
        if envelope.header_str("directive") == Some("IDENT") {
            self.register_satellite(&envelope).await;
            return;
        }

        let Some(correlation_id) = envelope.correlation_id.clone() else {
            debug!(message_id = %envelope.message_id, "uncorrelated inbound message ignored");
            return;
        };

        let receipt = receipt_from(&envelope);
        let mut state = self.state.lock().await;
        if let Some(action) = state.post_actions.remove(&correlation_id) {
            if receipt.status == ReceiptStatus::Ok {
                apply_post_action(&mut state.store, action);
                self.maybe_flush(&state.store);
            }
        }
        state.promises.resolve(&correlation_id, receipt);
    }

    /// Any inbound IDENT registers its satellite; worker IDENTs also kick
    /// off the object-store credential handshake.
    async fn register_satellite(self: &Arc<Self>, envelope: &Envelope) {
        let hostname = envelope
            .payload
            .get("hostname")
            .and_then(Value::as_str)
            .or_else(|| envelope.header_str("hostname"));
        let Some(hostname) = hostname else {
            debug!("IDENT without hostname discarded");
            return;
        };
        let workerpool = envelope
            .payload
            .get("workerpool")
            .and_then(Value::as_str)
            .or_else(|| envelope.header_str("workerpool"));

        let key = match workerpool {
            Some(pool) => RoutingKey::worker(hostname, pool).to_string(),
            None => RoutingKey::manager(hostname).to_string(),
        };
        {
            let mut state = self.state.lock().await;
            state.registry.register(&key);
        }
        if workerpool.is_some() {
            self.verify_objstore(&key).await;
        }
    }

    /// Ask a worker whether it holds object-store credentials; push ours if
    /// it reports none.
    async fn verify_objstore(self: &Arc<Self>, worker_key: &str) {
        let envelope = Envelope::new(MessageKind::Directive, worker_key, Value::Null)
            .with_header("directive", "VERIFY_OBJSTORE");

        let creds = self.objstore.clone();
        let bus = self.bus.clone();
        let state = self.state.clone();
        let key = worker_key.to_string();
        {
            let mut guard = self.state.lock().await;
            guard
                .promises
                .register_call(&envelope.message_id, move |receipt| {
                    let empty = match &receipt.payload {
                        Value::Null => true,
                        Value::Object(map) => map.is_empty(),
                        _ => false,
                    };
                    if !empty {
                        debug!(worker = %key, "worker already holds object-store credentials");
                        return;
                    }
                    let Some(creds) = creds else {
                        warn!(worker = %key, "worker lacks object-store credentials and none are configured");
                        return;
                    };
                    let Some(reply_id) = receipt.message_id else {
                        return;
                    };
                    tokio::spawn(async move {
                        let mut push = Envelope::new(
                            MessageKind::Directive,
                            &key,
                            serde_json::to_value(&creds).unwrap_or(Value::Null),
                        )
                        .with_header("directive", "AWSCREDS");
                        // Correlated to the VERIFY_OBJSTORE reply itself.
                        push.correlation_id = Some(reply_id);

                        let push_id = push.message_id.clone();
                        let log_key = key.clone();
                        state.lock().await.promises.register_call(&push_id, move |receipt| {
                            if receipt.status == ReceiptStatus::Ok {
                                info!(worker = %log_key, "object-store credentials applied");
                            } else {
                                warn!(worker = %log_key, "worker failed to apply object-store credentials");
                            }
                        });
                        if let Err(e) = bus.publish(Exchange::Backend, &key, push).await {
                            warn!(worker = %key, "AWSCREDS push failed: {e}");
                        }
                    });
                });
        }

        self.publish_or_fail(Exchange::Backend, worker_key, envelope)
            .await;
    }

    // --- console fan-out ----------------------------------------------------

    async fn fan_out_console(&self, envelope: Envelope) {
        let Some(server) = envelope.header_str("server") else {
            debug!("console line without server header discarded");
            return;
        };
        let Ok(key @ ScreenKey::Server { .. }) = ScreenKey::parse(server) else {
            debug!(server, "console line with malformed server fqdn discarded");
            return;
        };

        let state = self.state.lock().await;
        for session in state.sessions.values() {
            let allowed = state
                .store
                .test_permission(&key, &session.user, "console")
                .unwrap_or(false);
            if allowed {
                let _ = session.tx.send(json!({
                    "type": "stdout",
                    "server": server,
                    "line": envelope.payload,
                }));
            }
        }
    }

    // --- plumbing -----------------------------------------------------------

    async fn publish_or_fail(self: &Arc<Self>, exchange: Exchange, key: &str, envelope: Envelope) {
        let message_id = envelope.message_id.clone();
        if let Err(e) = self.bus.publish(exchange, key, envelope).await {
            warn!(routing_key = key, "publish failed: {e}");
            let mut state = self.state.lock().await;
            state.post_actions.remove(&message_id);
            state.promises.resolve(
                &message_id,
                Receipt {
                    status: ReceiptStatus::Error,
                    payload: json!({ "error": "transport" }),
                    headers: Map::new(),
                    message_id: None,
                },
            );
        }
    }

    fn maybe_flush(&self, store: &PermissionStore) {
        if let Some(path) = &self.snapshot {
            if let Err(e) = store.save_snapshot(path) {
                warn!(path = %path.display(), "snapshot flush failed: {e}");
            }
        }
    }

    /// Resolve overdue pending calls as timed out on an interval.
    pub fn spawn_reaper(self: &Arc<Self>, ttl: Duration) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let reaped = state.lock().await.promises.reap_expired(ttl);
                if reaped > 0 {
                    warn!(reaped, "pending calls timed out");
                }
            }
        });
    }

    /// Optional satellite staleness sweep.
    pub fn spawn_staleness_sweep(self: &Arc<Self>, ttl: Duration) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(10)) / 2);
            loop {
                interval.tick().await;
                state.lock().await.registry.mark_stale(ttl);
            }
        });
    }

    /// Flush the permission snapshot, if one is configured.
    pub async fn flush_snapshot(&self) {
        let state = self.state.lock().await;
        self.maybe_flush(&state.store);
    }
}

fn apply_post_action(store: &mut PermissionStore, action: PostAction) {
    match action {
        PostAction::CreatePoolScreen { host, pool, owner } => {
            let key = ScreenKey::pool(&host, &pool);
            if let Err(e) = store.create_screen(key.clone(), &owner) {
                warn!(screen = %key, "pool screen creation skipped: {e}");
            }
        }
        PostAction::RemovePoolScreen { host, pool } => {
            let key = ScreenKey::pool(&host, &pool);
            if let Err(e) = store.remove_screen(&key) {
                warn!(screen = %key, "pool screen removal skipped: {e}");
            }
        }
        PostAction::RemoveServerScreen { key } => {
            if let Err(e) = store.remove_screen(&key) {
                warn!(screen = %key, "server screen removal skipped: {e}");
            }
        }
    }
}

fn receipt_from(envelope: &Envelope) -> Receipt {
    let failed = envelope.headers.contains_key("exception")
        || envelope.payload.get("success").and_then(Value::as_bool) == Some(false)
        || envelope.payload.get("ok").and_then(Value::as_bool) == Some(false);
    Receipt {
        status: if failed {
            ReceiptStatus::Error
        } else {
            ReceiptStatus::Ok
        },
        payload: envelope.payload.clone(),
        headers: envelope.headers.clone(),
        message_id: Some(envelope.message_id.clone()),
    }
}

fn send_receipt(
    tx: &mpsc::UnboundedSender<Value>,
    kind: &str,
    request_id: Option<String>,
    echo: Value,
    receipt: Receipt,
) {
    let _ = tx.send(json!({
        "type": kind,
        "request_id": request_id,
        "about": echo,
        "status": receipt.status.as_str(),
        "payload": receipt.payload,
        "headers": receipt.headers,
    }));
}

fn send_error(
    tx: &mpsc::UnboundedSender<Value>,
    request_id: Option<String>,
    reason: &str,
    detail: &str,
) {
    let _ = tx.send(json!({
        "type": "error",
        "request_id": request_id,
        "reason": reason,
        "detail": detail,
    }));
}
