//! Event Router (C7, spec §4.7): decodes inbound frames, restores
//! order via the packet orderer, enqueues per-account, and dispatches
//! sequentially through listeners. Also runs the disconnect watchdog
//! and synthesizes post-sync listener notifications.

use crate::clock::SharedClock;
use crate::config::ClientOptions;
use crate::error::GatewayError;
use crate::listeners::ListenerRegistry;
use crate::model::{format_timestamp, parse_timestamp, AccountId, EventEnvelope, InstanceKey};
use crate::ordering::PacketOrderer;
use crate::socket_pool::SocketPool;
use crate::supervisor::SubscriptionSupervisor;
use crate::transport::InboundFrame;
use dashmap::DashMap;
use dashmap::DashSet;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// How long an instance may go without an `authenticated`/`status` frame
/// before the watchdog treats it as disconnected (spec §4.7, §5).
const DISCONNECT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

struct SyncFlags {
    positions_updated: bool,
    orders_updated: bool,
}

/// Tracks which InstanceKeys are currently authenticated (§3
/// ConnectedHosts): a key's disconnect is "final" when it's the only
/// entry for its `accountId:instanceNumber` prefix.
#[derive(Default)]
struct ConnectedHosts {
    by_key: HashMap<InstanceKey, String>,
}

impl ConnectedHosts {
    fn insert(&mut self, key: InstanceKey, host: String) {
        self.by_key.insert(key, host);
    }

    fn remove(&mut self, key: &InstanceKey) {
        self.by_key.remove(key);
    }

    fn contains(&self, key: &InstanceKey) -> bool {
        self.by_key.contains_key(key)
    }

    fn is_only_active(&self, key: &InstanceKey) -> bool {
        self.by_key
            .keys()
            .filter(|k| k.account_id == key.account_id && k.instance_number == key.instance_number)
            .count()
            <= 1
    }
}

pub struct EventRouter {
    options: ClientOptions,
    clock: SharedClock,
    orderer: Arc<PacketOrderer>,
    pool: Arc<SocketPool>,
    supervisor: Arc<SubscriptionSupervisor>,
    listeners: ListenerRegistry,
    connected_hosts: AsyncMutex<ConnectedHosts>,
    sync_flags: AsyncMutex<HashMap<String, SyncFlags>>,
    active_subscriptions: DashSet<AccountId>,
    last_unsubscribe_attempt: DashMap<AccountId, Instant>,
    queues: DashMap<AccountId, mpsc::UnboundedSender<EventEnvelope>>,
    watchdogs: DashMap<InstanceKey, Arc<AtomicU64>>,
}

impl EventRouter {
    pub fn new(
        options: ClientOptions,
        clock: SharedClock,
        pool: Arc<SocketPool>,
        supervisor: Arc<SubscriptionSupervisor>,
        listeners: ListenerRegistry,
    ) -> Arc<Self> {
        let orderer = Arc::new(PacketOrderer::new(clock.clone(), options.packet_ordering_timeout));
        Arc::new(Self {
            options,
            clock,
            orderer,
            pool,
            supervisor,
            listeners,
            connected_hosts: AsyncMutex::new(ConnectedHosts::default()),
            sync_flags: AsyncMutex::new(HashMap::new()),
            active_subscriptions: DashSet::new(),
            last_unsubscribe_attempt: DashMap::new(),
            queues: DashMap::new(),
            watchdogs: DashMap::new(),
        })
    }

    /// (Re)arms the 60s disconnect watchdog for `key`: if no
    /// `authenticated`/`status` frame resets it again before it fires,
    /// the instance is treated as disconnected (spec §4.7).
    fn reset_watchdog(self: &Arc<Self>, key: InstanceKey) {
        let counter = self
            .watchdogs
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        let generation = counter.fetch_add(1, Ordering::SeqCst) + 1;

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_WATCHDOG_TIMEOUT).await;
            if counter.load(Ordering::SeqCst) == generation {
                this.fire_watchdog(key).await;
            }
        });
    }

    /// Invalidates any pending watchdog timer for `key` (a real
    /// `disconnected` frame already did the watchdog's job).
    fn cancel_watchdog(&self, key: &InstanceKey) {
        if let Some((_, counter)) = self.watchdogs.remove(key) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fired when 60s pass with no `authenticated`/`status` frame for
    /// `key`: notifies the supervisor and synthesizes a `disconnected`
    /// event through the normal dispatch path.
    async fn fire_watchdog(self: &Arc<Self>, key: InstanceKey) {
        tracing::warn!(
            account_id = key.account_id,
            instance_index = key.instance_number,
            "disconnect watchdog fired, no authenticated/status frame within timeout"
        );
        let only_active = self.connected_hosts.lock().await.is_only_active(&key);
        if only_active {
            self.supervisor.on_timeout(&key.account_id, key.instance_number);
        }
        let synthetic = EventEnvelope {
            event_type: "disconnected".to_string(),
            account_id: key.account_id.clone(),
            instance_index: Some(key.instance_number),
            host: key.host.clone(),
            sequence_number: None,
            synchronization_id: None,
            payload: serde_json::Map::new(),
        };
        self.enqueue(synthetic).await;
    }

    pub fn mark_subscription_active(&self, account_id: &str) {
        self.active_subscriptions.insert(account_id.to_string());
    }

    pub fn mark_subscription_inactive(&self, account_id: &str) {
        self.active_subscriptions.remove(account_id);
    }

    /// Entry point for a raw inbound frame off the wire (spec §4.7). The
    /// outer envelope's `type` is one of `response`, `processingError`,
    /// or a `synchronization` event name (§6); the first two complete a
    /// pending RPC on the originating socket rather than flowing through
    /// the reorder/dispatch pipeline below.
    pub async fn on_frame(self: &Arc<Self>, socket_index: usize, frame: InboundFrame) {
        let Ok(raw) = serde_json::from_str::<Value>(&frame.raw) else {
            tracing::warn!(socket_index, "could not decode inbound frame");
            return;
        };

        match raw.get("type").and_then(Value::as_str) {
            Some("response") | Some("processingError") => {
                self.complete_rpc(socket_index, raw).await;
                return;
            }
            _ => {}
        }

        let Ok(mut event) = serde_json::from_str::<EventEnvelope>(&frame.raw) else {
            tracing::warn!(socket_index, "could not decode inbound frame");
            return;
        };

        if let Some(sync_id) = &event.synchronization_id {
            let socket_has_sync = self
                .pool
                .socket(socket_index)
                .map(|s| s.throttler.is_active(sync_id))
                .unwrap_or(false);
            if !socket_has_sync {
                event.mark_noop();
            }
        }

        if !self.active_subscriptions.contains(&event.account_id) && event.event_type != "disconnected" {
            self.maybe_throttled_unsubscribe(&event.account_id).await;
            return;
        }

        let converted = convert_timestamps_owned(Value::Object(std::mem::take(&mut event.payload)));
        if let Value::Object(map) = converted {
            event.payload = map;
        }

        let (ready, out_of_order) = self.orderer.restore_order(event);

        if let Some(oo) = out_of_order {
            tracing::warn!(
                account_id = oo.account_id,
                instance_index = oo.instance_index,
                expected = oo.expected,
                actual = oo.actual,
                "packet ordering gap skipped"
            );
            self.supervisor.schedule_subscribe(oo.account_id.clone(), oo.instance_index);
        }

        for event in ready {
            if event.is_noop() {
                continue;
            }
            self.enqueue(event).await;
        }
    }

    /// Completes the pending RPC `requestId` names on `socket_index`,
    /// mapping a `processingError` frame through [`classify`] and a
    /// `response` frame's remaining fields through as the result value.
    /// An `Unauthorized` classification closes the whole pool (spec
    /// §4.1/§7: an unauthorized token can't recover by retrying).
    async fn complete_rpc(&self, socket_index: usize, raw: Value) {
        let Some(socket) = self.pool.socket(socket_index) else { return };
        let Some(request_id) = raw.get("requestId").and_then(Value::as_str).map(str::to_string) else {
            return;
        };

        let result = if raw.get("type").and_then(Value::as_str) == Some("processingError") {
            match serde_json::from_value::<crate::error::ErrorFrame>(raw.clone()) {
                Ok(frame) => Err(crate::error::classify(frame)),
                Err(_) => Err(GatewayError::Internal {
                    message: "malformed processingError frame".into(),
                }),
            }
        } else {
            Ok(raw)
        };

        let is_unauthorized = matches!(result, Err(GatewayError::Unauthorized { .. }));
        socket.complete_pending(&request_id, result);
        if is_unauthorized {
            tracing::error!("gateway rejected the token as unauthorized, closing the pool");
            self.pool.close().await;
        }
    }

    async fn maybe_throttled_unsubscribe(&self, account_id: &str) {
        let now = Instant::now();
        let should_send = match self.last_unsubscribe_attempt.get(account_id) {
            Some(last) => now.duration_since(*last) >= self.options.unsubscribe_throttling_interval,
            None => true,
        };
        if should_send {
            self.last_unsubscribe_attempt.insert(account_id.to_string(), now);
            tracing::debug!(account_id, "dropping event for inactive subscription, throttled unsubscribe");
        }
    }

    /// Places an event on the per-account queue, spinning up the
    /// single-consumer drain task if one isn't already running (spec
    /// §4.7: listeners see events in the orderer's order, per account).
    async fn enqueue(self: &Arc<Self>, event: EventEnvelope) {
        let account_id = event.account_id.clone();
        let sender = self.queues.get(&account_id).map(|e| e.clone());
        let sender = match sender {
            Some(s) if !s.is_closed() => s,
            _ => {
                let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();
                let this = self.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let started = Instant::now();
                        this.dispatch(event).await;
                        let elapsed = started.elapsed();
                        if elapsed > Duration::from_secs(1) {
                            tracing::warn!(elapsed_secs = elapsed.as_secs_f64(), "listener dispatch took too long");
                        }
                    }
                });
                self.queues.insert(account_id.clone(), tx.clone());
                tx
            }
        };
        let _ = sender.send(event);
    }

    /// Per-event dispatch table (spec §4.7).
    async fn dispatch(self: &Arc<Self>, event: EventEnvelope) {
        let account_id = event.account_id.clone();
        let instance_index = event.instance_index();
        let instance_label = instance_index.to_string();
        let key = InstanceKey::new(account_id.clone(), instance_index, event.host.clone());
        let listeners = self.listeners.synchronization_listeners(&account_id);

        match event.event_type.as_str() {
            "authenticated" => {
                let host = event.host.clone().unwrap_or_default();
                {
                    let mut hosts = self.connected_hosts.lock().await;
                    hosts.insert(key.clone(), host);
                }
                self.supervisor.cancel_subscribe(&account_id, instance_index);
                self.reset_watchdog(key.clone());
                let replicas = self.connected_hosts.lock().await.by_key.len() as u32;
                for l in &listeners {
                    l.on_connected(&instance_label, replicas).await;
                }
            }
            "disconnected" => {
                self.cancel_watchdog(&key);
                let only_active = self.connected_hosts.lock().await.is_only_active(&key);
                if only_active {
                    self.supervisor.on_disconnected(account_id.clone(), instance_index);
                    for l in &listeners {
                        l.on_disconnected(&instance_label).await;
                    }
                } else {
                    self.orderer.on_stream_closed(&key);
                    if let Some(socket) = self.pool.socket_index_for(&account_id).and_then(|i| self.pool.socket(i)) {
                        socket.throttler.remove_by_account(&account_id);
                    }
                    for l in &listeners {
                        l.on_stream_closed(&instance_label).await;
                    }
                }
                self.connected_hosts.lock().await.remove(&key);
            }
            "status" => {
                let authenticated = self.connected_hosts.lock().await.contains(&key);
                if !authenticated {
                    self.supervisor.cancel_subscribe(&account_id, instance_index);
                    self.supervisor.schedule_subscribe(account_id.clone(), instance_index);
                } else {
                    self.reset_watchdog(key.clone());
                    let connected = event
                        .payload
                        .get("connected")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    for l in &listeners {
                        l.on_broker_connection_status_changed(&instance_label, connected).await;
                    }
                    if let Some(health) = event.payload.get("healthStatus") {
                        for l in &listeners {
                            l.on_health_status(&instance_label, health).await;
                        }
                    }
                }
            }
            "synchronizationStarted" => {
                if let Some(sync_id) = &event.synchronization_id {
                    let positions_updated = event.payload.get("positionsUpdated").and_then(Value::as_bool).unwrap_or(true);
                    let orders_updated = event.payload.get("ordersUpdated").and_then(Value::as_bool).unwrap_or(true);
                    self.sync_flags.lock().await.insert(
                        sync_id.clone(),
                        SyncFlags {
                            positions_updated,
                            orders_updated,
                        },
                    );
                }
                for l in &listeners {
                    l.on_synchronization_started(&instance_label).await;
                }
            }
            "accountInformation" => {
                if let Some(info) = event.payload.get("accountInformation") {
                    for l in &listeners {
                        l.on_account_information_updated(&instance_label, info).await;
                    }
                }
                self.maybe_synthesize_positions(&event, &listeners, &instance_label).await;
            }
            "positions" => {
                if let Some(positions) = event.payload.get("positions") {
                    for l in &listeners {
                        l.on_positions_replaced(&instance_label, positions).await;
                    }
                }
                self.maybe_synthesize_positions(&event, &listeners, &instance_label).await;
            }
            "orders" => {
                if let Some(orders) = event.payload.get("orders") {
                    for l in &listeners {
                        l.on_orders_replaced(&instance_label, orders).await;
                    }
                }
                self.maybe_synthesize_orders(&event, &listeners, &instance_label).await;
            }
            "historyOrders" => {
                if let Some(orders) = event.payload.get("historyOrders") {
                    for l in &listeners {
                        l.on_history_orders_added(&instance_label, orders).await;
                    }
                }
            }
            "deals" => {
                if let Some(deals) = event.payload.get("deals") {
                    for l in &listeners {
                        l.on_deals_added(&instance_label, deals).await;
                    }
                }
            }
            "update" => {
                for l in &listeners {
                    l.on_update(&instance_label, &Value::Object(event.payload.clone())).await;
                }
                if let Some(ts) = event.payload.get("timestamps") {
                    let mut ts = ts.clone();
                    if let Value::Object(map) = &mut ts {
                        map.insert("clientProcessingFinished".into(), Value::String(format_timestamp(self.clock.now())));
                    }
                    for l in self.listeners.latency_listeners() {
                        l.on_update(&account_id, &ts).await;
                    }
                }
            }
            "prices" => {
                for l in &listeners {
                    l.on_symbol_prices_updated(&instance_label, &Value::Object(event.payload.clone())).await;
                }
                if let Some(prices) = event.payload.get("prices").and_then(Value::as_array) {
                    for price in prices {
                        if price.get("timestamps").is_some() {
                            let mut price = price.clone();
                            if let Value::Object(map) = &mut price {
                                map.insert("clientProcessingFinished".into(), Value::String(format_timestamp(self.clock.now())));
                            }
                            for l in self.listeners.latency_listeners() {
                                l.on_symbol_price(&account_id, &price).await;
                            }
                        }
                    }
                }
            }
            "dealSynchronizationFinished" => {
                if let Some(sync_id) = &event.synchronization_id {
                    if let Some(socket) = self.pool.socket_index_for(&account_id).and_then(|i| self.pool.socket(i)) {
                        socket.throttler.remove_synchronization_id(sync_id);
                    }
                    for l in &listeners {
                        l.on_deal_synchronization_finished(&instance_label, sync_id).await;
                    }
                }
            }
            "orderSynchronizationFinished" => {
                if let Some(sync_id) = &event.synchronization_id {
                    for l in &listeners {
                        l.on_order_synchronization_finished(&instance_label, sync_id).await;
                    }
                }
            }
            "downgradeSubscription" => {
                for l in &listeners {
                    l.on_subscription_downgraded(&instance_label, &Value::Object(event.payload.clone())).await;
                }
            }
            other => {
                tracing::trace!(event_type = other, "unrecognized synchronization event, ignored");
            }
        }
    }

    async fn maybe_synthesize_positions(&self, event: &EventEnvelope, listeners: &[Arc<dyn crate::listeners::SynchronizationListener>], label: &str) {
        let Some(sync_id) = &event.synchronization_id else { return };
        let mut flags = self.sync_flags.lock().await;
        let Some(entry) = flags.get_mut(sync_id) else { return };
        if !entry.positions_updated {
            entry.positions_updated = true;
            for l in listeners {
                l.on_positions_synchronized(label, sync_id).await;
            }
        }
        if entry.positions_updated && entry.orders_updated {
            flags.remove(sync_id);
        }
    }

    async fn maybe_synthesize_orders(&self, event: &EventEnvelope, listeners: &[Arc<dyn crate::listeners::SynchronizationListener>], label: &str) {
        let Some(sync_id) = &event.synchronization_id else { return };
        let mut flags = self.sync_flags.lock().await;
        let Some(entry) = flags.get_mut(sync_id) else { return };
        if !entry.orders_updated {
            entry.orders_updated = true;
            for l in listeners {
                l.on_pending_orders_synchronized(label, sync_id).await;
            }
        }
        if entry.positions_updated && entry.orders_updated {
            flags.remove(sync_id);
        }
    }
}

/// Converts any string field whose name matches `time`/`Time` (except
/// `brokerTime`/`BrokerTime`/`timeframe`) into a parsed timestamp,
/// recursing into nested maps/lists (spec §4.7). Kept as an explicit
/// field-name check rather than a compiled regex since the crate
/// avoids pulling in the `regex` dependency for one predicate.
fn convert_timestamps_owned(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let converted = convert_timestamps_owned(v);
                let converted = if is_time_field(&k) {
                    try_parse_field(converted)
                } else {
                    converted
                };
                out.insert(k, converted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(convert_timestamps_owned).collect()),
        other => other,
    }
}

fn try_parse_field(value: Value) -> Value {
    match &value {
        Value::String(s) => match parse_timestamp(s) {
            Some(t) => Value::String(format_timestamp(t)),
            None => value,
        },
        _ => value,
    }
}

fn is_time_field(name: &str) -> bool {
    if name == "brokerTime" || name == "BrokerTime" || name == "timeframe" {
        return false;
    }
    name.contains("time") || name.contains("Time")
}
