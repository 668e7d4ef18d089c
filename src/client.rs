//! Core facade (C10, spec §4.10): wires the URL resolver, socket pool,
//! RPC multiplexer, subscription supervisor, packet orderer/event
//! router, and listener registry into the public client surface.

use crate::clock::{system_clock, SharedClock};
use crate::config::ClientOptions;
use crate::error::GatewayError;
use crate::event_router::EventRouter;
use crate::listeners::{LatencyListener, ListenerRegistry, ReconnectListener, SynchronizationListener};
use crate::model::AccountId;
use crate::rpc::RpcMultiplexer;
use crate::socket_pool::{Connector, SocketPool, WsConnector};
use crate::supervisor::SubscriptionSupervisor;
use crate::url_resolver::UrlResolver;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// The top-level handle applications hold (spec §2 "Core facade").
/// Clone is cheap: it's `Arc`-backed internally.
pub struct GatewayClient {
    options: ClientOptions,
    token: String,
    pool: Arc<SocketPool>,
    rpc: Arc<RpcMultiplexer>,
    supervisor: Arc<SubscriptionSupervisor>,
    router: Arc<EventRouter>,
    listeners: ListenerRegistry,
}

impl GatewayClient {
    /// Resolves the gateway URL and assembles every component (spec
    /// §4.9 then §4.10). Does not connect any socket yet; the first
    /// `subscribe` does that lazily via the socket pool.
    pub async fn connect(options: ClientOptions, token: String) -> Result<Arc<Self>, GatewayError> {
        Self::connect_with_clock(options, token, system_clock()).await
    }

    pub async fn connect_with_clock(options: ClientOptions, token: String, clock: SharedClock) -> Result<Arc<Self>, GatewayError> {
        let resolver = UrlResolver::new(options.domain.clone(), options.region.clone(), options.use_shared_client_api);
        let url = resolver.resolve(&token).await?;
        Ok(Self::assemble(options, token, clock, url, Arc::new(WsConnector)))
    }

    /// Assembles every component against an already-resolved `url` and a
    /// caller-supplied [`Connector`], skipping the HTTP provisioning
    /// round trip. Used by tests (and embedders with their own gateway
    /// discovery) to drive the pool/supervisor/router machinery against
    /// an in-memory transport.
    pub fn assemble(options: ClientOptions, token: String, clock: SharedClock, url: String, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = SocketPool::new_with_connector(options.clone(), clock.clone(), url, token.clone(), frame_tx, connector);
        let rpc = Arc::new(RpcMultiplexer::new(pool.clone(), options.clone(), clock.clone()));
        let supervisor = SubscriptionSupervisor::new(options.clone(), clock.clone(), rpc.clone(), pool.clone());
        let listeners = ListenerRegistry::new();
        let router = EventRouter::new(options.clone(), clock.clone(), pool.clone(), supervisor.clone(), listeners.clone());

        let router_for_frames = router.clone();
        tokio::spawn(async move {
            while let Some((socket_index, frame)) = frame_rx.recv().await {
                router_for_frames.on_frame(socket_index, frame).await;
            }
        });

        Arc::new(Self {
            options,
            token,
            pool,
            rpc,
            supervisor,
            router,
            listeners,
        })
    }

    /// Subscribes `account_id`'s `instance_number` replica (spec §4.4 /
    /// §4.10). Idempotent: a subscribe already in flight is left alone.
    pub fn subscribe(self: &Arc<Self>, account_id: impl Into<AccountId>, instance_number: u32) {
        let account_id = account_id.into();
        self.router.mark_subscription_active(&account_id);
        self.supervisor.schedule_subscribe(account_id, instance_number);
    }

    /// Cancels the subscribe loop, drops the socket assignment, and
    /// stops routing events for `account_id`'s `instance_number`
    /// replica. Idempotent (spec §4.4 `cancelSubscribe`).
    pub fn unsubscribe(&self, account_id: &str, instance_number: u32) {
        self.supervisor.cancel_subscribe(account_id, instance_number);
        self.pool.unassign(account_id);
        self.router.mark_subscription_inactive(account_id);
    }

    pub fn add_synchronization_listener(&self, account_id: &str, listener: Arc<dyn SynchronizationListener>) {
        self.listeners.add_synchronization_listener(account_id, listener);
    }

    pub fn remove_synchronization_listener(&self, account_id: &str, listener: &Arc<dyn SynchronizationListener>) {
        self.listeners.remove_synchronization_listener(account_id, listener);
    }

    pub fn add_latency_listener(&self, listener: Arc<dyn LatencyListener>) {
        self.listeners.add_latency_listener(listener);
    }

    pub fn add_reconnect_listener(&self, account_id: &str, listener: Arc<dyn ReconnectListener>) {
        self.listeners.add_reconnect_listener(account_id, listener);
    }

    /// Requests the gateway start a full-state synchronization (spec
    /// §4.3's `scheduleSynchronize` contract): admits `synchronization_id`
    /// through the account's socket throttler before emitting, capping
    /// how many full-state syncs run concurrently on one socket.
    pub async fn synchronize(&self, account_id: &str, instance_index: u32, synchronization_id: String) -> Result<Value, GatewayError> {
        let mut extra = Map::new();
        extra.insert("requestId".into(), Value::String(synchronization_id));
        extra.insert("instanceIndex".into(), Value::from(instance_index));
        self.rpc_call(account_id, "synchronize", extra, None).await
    }

    /// Sends a trade request (spec §4.6: single-attempt, not retried).
    pub async fn trade(&self, account_id: &str, trade: Value) -> Result<Value, GatewayError> {
        let mut extra = Map::new();
        if let Value::Object(map) = trade {
            extra = map;
        }
        self.rpc.call(&account_id.to_string(), "trade", extra, None).await
    }

    /// Issues an arbitrary RPC request of `request_type`, retried per
    /// spec §4.6's policy.
    pub async fn rpc_call(
        &self,
        account_id: &str,
        request_type: &str,
        extra: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        self.rpc.call(&account_id.to_string(), request_type, extra, timeout).await
    }

    /// Fetches account information via the gateway's `getAccountInformation` RPC.
    pub async fn get_account_information(&self, account_id: &str) -> Result<Value, GatewayError> {
        self.rpc_call(account_id, "getAccountInformation", Map::new(), None).await
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Tears the whole client down: closes every socket, failing any
    /// pending RPCs, and cancels every running subscribe loop.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
