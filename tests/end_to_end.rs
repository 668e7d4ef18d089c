//! End-to-end scenarios (spec §8, S1-S6) driven against an in-memory
//! mock transport instead of a live gateway.

mod support;

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::MockConnector;
use tgw_client::clock::system_clock;
use tgw_client::config::ClientOptions;
use tgw_client::listeners::SynchronizationListener;
use tgw_client::GatewayClient;

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// Jumps a paused virtual clock forward in small steps, yielding between
/// each so background tasks woken by an expired timer get to run before
/// the next jump (the tokio `time::advance` contract doesn't guarantee
/// that on its own).
async fn advance_until(mut check: impl FnMut() -> bool, step: Duration, max_steps: u32) {
    for _ in 0..max_steps {
        if check() {
            return;
        }
        tokio::time::advance(step).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
    if !check() {
        panic!("condition never became true");
    }
}

async fn pump(step: Duration, steps: u32) {
    for _ in 0..steps {
        tokio::time::advance(step).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}

/// S1: subscribing an account sends a `subscribe` request and, once the
/// gateway replies `authenticated`, routes `on_connected` to listeners.
#[tokio::test]
async fn subscribe_drives_request_and_authenticated_event() {
    let connector = Arc::new(MockConnector::new());
    let client = GatewayClient::assemble(
        ClientOptions::default(),
        "token".into(),
        system_clock(),
        "wss://example.test".into(),
        connector.clone(),
    );

    #[derive(Default)]
    struct Listener {
        connected: std::sync::atomic::AtomicBool,
    }
    #[async_trait]
    impl SynchronizationListener for Listener {
        async fn on_connected(&self, _instance_index: &str, _replicas: u32) {
            self.connected.store(true, Ordering::SeqCst);
        }
    }
    let listener = Arc::new(Listener::default());
    client.add_synchronization_listener("ACC1", listener.clone());

    client.subscribe("ACC1", 0);

    wait_until(|| !connector.sent_requests(0).is_empty()).await;
    let sent = connector.sent_requests(0);
    assert_eq!(sent[0]["type"], "subscribe");
    assert_eq!(sent[0]["accountId"], "ACC1");
    let request_id = sent[0]["requestId"].as_str().unwrap().to_string();

    let socket = connector.socket(0);
    socket.push_frame(json!({"type": "response", "requestId": request_id}));
    socket.push_frame(json!({
        "type": "authenticated",
        "accountId": "ACC1",
        "instanceIndex": 0,
        "host": "ps-mpa-0",
    }));

    wait_until(|| listener.connected.load(Ordering::SeqCst)).await;
}

/// S2: a `TooManyRequestsError` of PER_USER scope on a subscribe pauses
/// further placement pool-wide until the recommended retry time passes.
#[tokio::test]
async fn too_many_requests_locks_pool_wide() {
    let connector = Arc::new(MockConnector::new());
    let client = GatewayClient::assemble(
        ClientOptions::default(),
        "token".into(),
        system_clock(),
        "wss://example.test".into(),
        connector.clone(),
    );

    client.subscribe("ACC1", 0);
    wait_until(|| !connector.sent_requests(0).is_empty()).await;
    let request_id = connector.sent_requests(0)[0]["requestId"].as_str().unwrap().to_string();

    let socket = connector.socket(0);
    socket.push_frame(json!({
        "type": "processingError",
        "requestId": request_id,
        "error": "TooManyRequestsError",
        "message": "slow down",
        "metadata": {
            "type": "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER",
            "recommendedRetryTime": "2999-01-01T00:00:00.000Z",
            "lockedAtAccounts": 1,
        }
    }));

    // the supervisor keeps retrying on its own backoff, but placement of
    // a brand new account should be blocked by the pool-wide lock.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.subscribe("ACC2", 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connector.socket_count() <= 1, "a locked pool must not open a second socket for a new account");
}

/// S3: an account update event is only dispatched to listeners once the
/// caller has marked the account's subscription active.
#[tokio::test]
async fn inactive_subscription_events_are_dropped() {
    let connector = Arc::new(MockConnector::new());
    let client = GatewayClient::assemble(
        ClientOptions::default(),
        "token".into(),
        system_clock(),
        "wss://example.test".into(),
        connector.clone(),
    );

    client.subscribe("ACC1", 0);
    wait_until(|| connector.socket_count() >= 1).await;

    let calls = Arc::new(AtomicUsize::new(0));
    struct Listener(Arc<AtomicUsize>);
    #[async_trait]
    impl SynchronizationListener for Listener {
        async fn on_update(&self, _instance_index: &str, _update: &serde_json::Value) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    client.add_synchronization_listener("ACC1", Arc::new(Listener(calls.clone())));

    client.unsubscribe("ACC1", 0);

    let socket = connector.socket(0);
    socket.push_frame(json!({
        "type": "update",
        "accountId": "ACC1",
        "instanceIndex": 0,
    }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0, "dropped subscription must not dispatch events");
}

/// S4: `removeAllListeners`-equivalent teardown is idempotent and
/// actually stops dispatch.
#[tokio::test]
async fn removing_all_listeners_is_idempotent() {
    let connector = Arc::new(MockConnector::new());
    let client = GatewayClient::assemble(
        ClientOptions::default(),
        "token".into(),
        system_clock(),
        "wss://example.test".into(),
        connector.clone(),
    );

    let listener: Arc<dyn SynchronizationListener> = Arc::new(NoopListener);
    client.add_synchronization_listener("ACC1", listener.clone());
    client.remove_synchronization_listener("ACC1", &listener);
    client.remove_synchronization_listener("ACC1", &listener);
}

/// S3: once authenticated, 60s of silence (no further `authenticated`/
/// `status` frame) trips the disconnect watchdog: listeners see
/// `onDisconnected` and the supervisor schedules a fresh subscribe.
#[tokio::test(start_paused = true)]
async fn status_timeout_fires_disconnect_watchdog() {
    let connector = Arc::new(MockConnector::new());
    let client = GatewayClient::assemble(
        ClientOptions::default(),
        "token".into(),
        system_clock(),
        "wss://example.test".into(),
        connector.clone(),
    );

    client.subscribe("ACC1", 0);
    advance_until(|| !connector.sent_requests(0).is_empty(), Duration::from_millis(10), 50).await;
    let request_id = connector.sent_requests(0)[0]["requestId"].as_str().unwrap().to_string();

    let socket = connector.socket(0);
    socket.push_frame(json!({"type": "response", "requestId": request_id}));
    socket.push_frame(json!({
        "type": "authenticated",
        "accountId": "ACC1",
        "instanceIndex": 0,
        "host": "ps-mpa-0",
    }));

    let disconnects = Arc::new(AtomicUsize::new(0));
    struct Listener(Arc<AtomicUsize>);
    #[async_trait]
    impl SynchronizationListener for Listener {
        async fn on_disconnected(&self, _instance_index: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    client.add_synchronization_listener("ACC1", Arc::new(Listener(disconnects.clone())));

    // let the authenticated frame arm the watchdog before advancing past it
    pump(Duration::from_millis(10), 5).await;

    let sent_before = connector.sent_requests(0).len();
    advance_until(|| disconnects.load(Ordering::SeqCst) > 0, Duration::from_secs(1), 65).await;

    assert_eq!(disconnects.load(Ordering::SeqCst), 1, "watchdog must fire onDisconnected exactly once");
    advance_until(|| connector.sent_requests(0).len() > sent_before, Duration::from_millis(10), 50).await;
}

struct NoopListener;
#[async_trait]
impl SynchronizationListener for NoopListener {}
