//! End-to-end router flows over an in-process bus: a live worker and
//! manager agent on one side, operator sessions on the other.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use garrison_common::providers::memory::{
    MemoryObjectStore, MemoryProvisioner, MemorySupervisor,
};
use garrison_common::{
    AccountProvisioner, MemoryBus, ObjectStore, ObjectStoreCreds, PermissionStore, ProviderFault,
    ScreenKey,
};
use garrison_manager::agent::{ManagerAgent, WorkerSpawner};
use garrison_worker::agent::WorkerAgent;
use garrisond::router::Router;

const SETTLE: Duration = Duration::from_millis(150);

struct RecordingSpawner {
    pools: std::sync::Mutex<Vec<String>>,
}

impl RecordingSpawner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn spawned(&self) -> Vec<String> {
        self.pools.lock().unwrap().clone()
    }
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(&self, pool: &str) -> Result<(), ProviderFault> {
        self.pools.lock().unwrap().push(pool.to_string());
        Ok(())
    }
}

struct Fleet {
    router: Arc<Router>,
    supervisor: Arc<MemorySupervisor>,
    objstore: Arc<MemoryObjectStore>,
    provisioner: Arc<MemoryProvisioner>,
    spawner: Arc<RecordingSpawner>,
}

/// One router, one worker (`host1/poola`), one manager (`host1`), all on a
/// shared MemoryBus.
async fn fleet(objstore_creds: Option<ObjectStoreCreds>) -> Fleet {
    let bus = Arc::new(MemoryBus::new());
    let router = Router::new(
        bus.clone(),
        PermissionStore::new("admin"),
        objstore_creds,
        None,
    );
    router.run().await.unwrap();

    let supervisor = Arc::new(MemorySupervisor::with_servers(&[]));
    let objstore = Arc::new(MemoryObjectStore::new());
    let worker = WorkerAgent::new(
        bus.clone(),
        "host1",
        "poola",
        supervisor.clone(),
        objstore.clone(),
        Duration::from_secs(600),
    );
    let worker_run = worker.clone();
    tokio::spawn(async move { worker_run.run().await.unwrap() });

    let provisioner = Arc::new(MemoryProvisioner::new());
    let spawner = RecordingSpawner::new();
    let manager = ManagerAgent::new(
        bus,
        "host1",
        provisioner.clone(),
        spawner.clone(),
        Duration::from_millis(0),
        Duration::from_secs(600),
    );
    let manager_run = manager.clone();
    tokio::spawn(async move { manager_run.run().await.unwrap() });

    // Both agents announce; the worker's IDENT also runs the objstore
    // handshake.
    sleep(SETTLE).await;
    Fleet {
        router,
        supervisor,
        objstore,
        provisioner,
        spawner,
    }
}

async fn next_reply(rx: &mut UnboundedReceiver<Value>) -> Value {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("reply in time")
        .expect("session open")
}

async fn assert_silent(rx: &mut UnboundedReceiver<Value>) {
    sleep(SETTLE).await;
    assert!(rx.try_recv().is_err(), "expected no reply");
}

#[tokio::test]
async fn create_grant_start_scenario() {
    let fleet = fleet(None).await;
    let router = &fleet.router;

    let (alice, mut alice_rx) = router.attach_session("alice").await;
    let (bob, mut bob_rx) = router.attach_session("bob").await;

    // alice owns nothing; her create synthesizes the screen and succeeds.
    router
        .handle_request(
            &alice,
            json!({
                "id": "r1",
                "request": "command",
                "target": "host1.poola.myserver",
                "command": "create",
            }),
        )
        .await;
    let reply = next_reply(&mut alice_rx).await;
    assert_eq!(reply["type"], "receipt.command");
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["payload"]["success"], true);

    let key = ScreenKey::server("host1", "poola", "myserver");
    {
        let state = router.state();
        let state = state.lock().await;
        assert_eq!(state.store.screen(&key).unwrap().owner(), "alice");
        assert!(state.store.test_permission(&key, "alice", "anything").unwrap());
    }

    // bob holds no grant: his start is dropped without any reply.
    router
        .handle_request(
            &bob,
            json!({
                "id": "r2",
                "request": "command",
                "target": "host1.poola.myserver",
                "command": "start",
            }),
        )
        .await;
    assert_silent(&mut bob_rx).await;

    // alice grants bob `start`; the grant is acknowledged.
    router
        .handle_request(
            &alice,
            json!({
                "id": "r3",
                "request": "grant",
                "screen": "host1.poola.myserver",
                "user": "bob",
                "perm": "start",
            }),
        )
        .await;
    let reply = next_reply(&mut alice_rx).await;
    assert_eq!(reply["type"], "receipt");
    assert_eq!(reply["status"], "ok");

    // bob's resend now flows to the worker and back.
    router
        .handle_request(
            &bob,
            json!({
                "id": "r4",
                "request": "command",
                "target": "host1.poola.myserver",
                "command": "start",
            }),
        )
        .await;
    let reply = next_reply(&mut bob_rx).await;
    assert_eq!(reply["type"], "receipt.command");
    assert_eq!(reply["request_id"], "r4");
    assert_eq!(reply["payload"]["success"], true);
    assert_eq!(reply["payload"]["server_name"], "myserver");

    let invoked: Vec<String> = fleet
        .supervisor
        .invocations()
        .into_iter()
        .map(|(_, cmd, _)| cmd)
        .collect();
    assert_eq!(invoked, vec!["create".to_string(), "start".to_string()]);
}

#[tokio::test]
async fn delete_removes_screen_and_later_commands_drop() {
    let fleet = fleet(None).await;
    let router = &fleet.router;
    let (alice, mut alice_rx) = router.attach_session("alice").await;

    router
        .handle_request(
            &alice,
            json!({
                "request": "command",
                "target": "host1.poola.shortlived",
                "command": "create",
            }),
        )
        .await;
    next_reply(&mut alice_rx).await;

    router
        .handle_request(
            &alice,
            json!({
                "request": "command",
                "target": "host1.poola.shortlived",
                "command": "delete",
            }),
        )
        .await;
    let reply = next_reply(&mut alice_rx).await;
    assert_eq!(reply["payload"]["success"], true);

    {
        let state = fleet.router.state();
        let state = state.lock().await;
        assert!(!state
            .store
            .contains(&ScreenKey::server("host1", "poola", "shortlived")));
    }

    // The fqdn no longer exists: NotFound, logged and dropped.
    router
        .handle_request(
            &alice,
            json!({
                "request": "command",
                "target": "host1.poola.shortlived",
                "command": "status",
            }),
        )
        .await;
    assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn pool_named_target_is_rejected_up_front() {
    let fleet = fleet(None).await;
    let (alice, mut alice_rx) = fleet.router.attach_session("alice").await;

    fleet
        .router
        .handle_request(
            &alice,
            json!({
                "id": "bad",
                "request": "command",
                "target": "host1.poola._alpha-0",
                "command": "create",
            }),
        )
        .await;
    let reply = next_reply(&mut alice_rx).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "validation");
    // Nothing reached the worker.
    assert!(fleet.supervisor.invocations().is_empty());
}

#[tokio::test]
async fn unregistered_worker_drops_command() {
    let bus = Arc::new(MemoryBus::new());
    let router = Router::new(bus, PermissionStore::new("admin"), None, None);
    router.run().await.unwrap();

    let (alice, mut alice_rx) = router.attach_session("alice").await;
    router
        .handle_request(
            &alice,
            json!({
                "request": "command",
                "target": "host9.poolz.ghost",
                "command": "create",
            }),
        )
        .await;
    assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn mkpool_lifecycle_creates_and_removes_pool_screen() {
    let fleet = fleet(None).await;
    let router = &fleet.router;
    let (admin, mut admin_rx) = router.attach_session("admin").await;
    let pool_key = ScreenKey::pool("host1", "_alpha-0");

    router
        .handle_request(
            &admin,
            json!({
                "request": "directive",
                "host": "host1",
                "directive": "MKPOOL",
                "workerpool": "_alpha-0",
            }),
        )
        .await;
    let reply = next_reply(&mut admin_rx).await;
    assert_eq!(reply["type"], "receipt.directive");
    assert_eq!(reply["status"], "ok");
    assert!(fleet.provisioner.list_pools().unwrap().contains("_alpha-0"));
    {
        let state = router.state();
        let state = state.lock().await;
        assert_eq!(state.store.screen(&pool_key).unwrap().owner(), "admin");
    }

    // The pool screen now authorizes SPAWN for its owner.
    router
        .handle_request(
            &admin,
            json!({
                "request": "directive",
                "host": "host1",
                "directive": "SPAWN",
                "workerpool": "_alpha-0",
            }),
        )
        .await;
    let reply = next_reply(&mut admin_rx).await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(fleet.spawner.spawned(), vec!["_alpha-0".to_string()]);

    router
        .handle_request(
            &admin,
            json!({
                "request": "directive",
                "host": "host1",
                "directive": "REMOVE",
                "workerpool": "_alpha-0",
            }),
        )
        .await;
    let reply = next_reply(&mut admin_rx).await;
    assert_eq!(reply["status"], "ok");
    {
        let state = router.state();
        let state = state.lock().await;
        assert!(!state.store.contains(&pool_key));
    }
}

#[tokio::test]
async fn mkpool_without_root_grant_is_silently_dropped() {
    let fleet = fleet(None).await;
    let (alice, mut alice_rx) = fleet.router.attach_session("alice").await;

    fleet
        .router
        .handle_request(
            &alice,
            json!({
                "request": "directive",
                "host": "host1",
                "directive": "MKPOOL",
                "workerpool": "_alpha-0",
            }),
        )
        .await;
    assert_silent(&mut alice_rx).await;
    assert!(fleet.provisioner.list_pools().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_pool_name_never_reaches_the_provisioner() {
    let fleet = fleet(None).await;
    let (admin, mut admin_rx) = fleet.router.attach_session("admin").await;

    fleet
        .router
        .handle_request(
            &admin,
            json!({
                "request": "directive",
                "host": "host1",
                "directive": "MKPOOL",
                "workerpool": "NotAPool",
            }),
        )
        .await;
    let reply = next_reply(&mut admin_rx).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "validation");
    assert!(fleet.provisioner.list_pools().unwrap().is_empty());
}

#[tokio::test]
async fn worker_directive_round_trip() {
    let fleet = fleet(None).await;
    let router = &fleet.router;
    let (admin, mut admin_rx) = router.attach_session("admin").await;

    // Worker directives are gated by the pool screen.
    {
        let state = router.state();
        let mut state = state.lock().await;
        state
            .store
            .create_screen(ScreenKey::pool("host1", "poola"), "admin")
            .unwrap();
    }

    router
        .handle_request(
            &admin,
            json!({
                "request": "directive",
                "host": "host1",
                "pool": "poola",
                "directive": "LIST",
            }),
        )
        .await;
    let reply = next_reply(&mut admin_rx).await;
    assert_eq!(reply["type"], "receipt.directive");
    assert_eq!(reply["status"], "ok");
    assert!(reply["payload"]["servers"].is_array());
}

#[tokio::test]
async fn console_lines_reach_only_authorized_sessions() {
    let fleet = fleet(None).await;
    let router = &fleet.router;
    let (alice, mut alice_rx) = router.attach_session("alice").await;
    let (bob, mut bob_rx) = router.attach_session("bob").await;
    let _ = bob;

    // alice creates the server; the first command also starts the console
    // tail on the worker.
    router
        .handle_request(
            &alice,
            json!({
                "request": "command",
                "target": "host1.poola.myserver",
                "command": "create",
            }),
        )
        .await;
    next_reply(&mut alice_rx).await;

    fleet.supervisor.push_console("myserver", "[joined] steve");
    let line = next_reply(&mut alice_rx).await;
    assert_eq!(line["type"], "stdout");
    assert_eq!(line["server"], "host1.poola.myserver");
    assert_eq!(line["line"], "[joined] steve");

    // bob holds no console grant on that screen.
    assert_silent(&mut bob_rx).await;
}

#[tokio::test]
async fn objstore_handshake_pushes_creds_to_bare_worker() {
    let creds = ObjectStoreCreds {
        endpoint: "http://objstore:9000".into(),
        access_key: "ak".into(),
        secret_key: "sk".into(),
        region: "eu-west-1".into(),
    };
    let fleet = fleet(Some(creds.clone())).await;

    // The worker announced during fleet setup; HQ saw the empty
    // VERIFY_OBJSTORE reply and pushed AWSCREDS.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if fleet.objstore.credentials().is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "credentials never arrived"
        );
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(fleet.objstore.credentials().unwrap(), creds);
}

#[tokio::test]
async fn snapshot_flushes_after_screen_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("screens.json");

    let bus = Arc::new(MemoryBus::new());
    let router = Router::new(
        bus.clone(),
        PermissionStore::new("admin"),
        None,
        Some(path.clone()),
    );
    router.run().await.unwrap();

    let supervisor = Arc::new(MemorySupervisor::new());
    let worker = WorkerAgent::new(
        bus,
        "host1",
        "poola",
        supervisor,
        Arc::new(MemoryObjectStore::new()),
        Duration::from_secs(600),
    );
    let run = worker.clone();
    tokio::spawn(async move { run.run().await.unwrap() });
    sleep(SETTLE).await;

    let (alice, mut alice_rx) = router.attach_session("alice").await;
    router
        .handle_request(
            &alice,
            json!({
                "request": "command",
                "target": "host1.poola.myserver",
                "command": "create",
            }),
        )
        .await;
    next_reply(&mut alice_rx).await;
    router
        .handle_request(
            &alice,
            json!({
                "request": "grant",
                "screen": "host1.poola.myserver",
                "user": "bob",
                "perm": "start",
            }),
        )
        .await;
    next_reply(&mut alice_rx).await;

    // The flushed snapshot rebuilds into an equivalent store.
    let reloaded = PermissionStore::load_snapshot(&path, "admin").unwrap();
    let key = ScreenKey::server("host1", "poola", "myserver");
    assert_eq!(reloaded.screen(&key).unwrap().owner(), "alice");
    assert!(reloaded.test_permission(&key, "bob", "start").unwrap());
}

#[tokio::test]
async fn reaped_promise_surfaces_timeout_to_the_session() {
    let bus = Arc::new(MemoryBus::new());
    let router = Router::new(bus, PermissionStore::new("admin"), None, None);
    router.run().await.unwrap();

    // A worker that registered once and then died: its key is known but
    // nothing consumes its queue.
    {
        let state = router.state();
        let mut state = state.lock().await;
        state.registry.register("workers.host1.poola");
    }

    let (alice, mut alice_rx) = router.attach_session("alice").await;
    router
        .handle_request(
            &alice,
            json!({
                "request": "command",
                "target": "host1.poola.myserver",
                "command": "create",
            }),
        )
        .await;

    {
        let state = router.state();
        let mut state = state.lock().await;
        assert_eq!(state.promises.reap_expired(Duration::from_secs(0)), 1);
    }
    let reply = next_reply(&mut alice_rx).await;
    assert_eq!(reply["status"], "timed-out");
}
