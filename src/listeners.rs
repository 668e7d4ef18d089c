//! Listener Registry (C8, spec §4.8): synchronization listeners keyed
//! per account, global latency listeners, and per-account reconnect
//! listeners. Registration/removal are idempotent; `remove_all` resets
//! state for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Per-account synchronization event callbacks (spec §4.7's dispatch
/// table targets). Default methods no-op, so implementors only
/// override what they care about — mirrors the original SDK's listener
/// base class.
#[async_trait]
pub trait SynchronizationListener: Send + Sync {
    async fn on_connected(&self, _instance_index: &str, _replicas: u32) {}
    async fn on_disconnected(&self, _instance_index: &str) {}
    async fn on_stream_closed(&self, _instance_index: &str) {}
    async fn on_broker_connection_status_changed(&self, _instance_index: &str, _connected: bool) {}
    async fn on_health_status(&self, _instance_index: &str, _status: &Value) {}
    async fn on_synchronization_started(&self, _instance_index: &str) {}
    async fn on_account_information_updated(&self, _instance_index: &str, _info: &Value) {}
    async fn on_positions_replaced(&self, _instance_index: &str, _positions: &Value) {}
    async fn on_positions_synchronized(&self, _instance_index: &str, _synchronization_id: &str) {}
    async fn on_orders_replaced(&self, _instance_index: &str, _orders: &Value) {}
    async fn on_pending_orders_synchronized(&self, _instance_index: &str, _synchronization_id: &str) {}
    async fn on_history_orders_added(&self, _instance_index: &str, _orders: &Value) {}
    async fn on_deals_added(&self, _instance_index: &str, _deals: &Value) {}
    async fn on_update(&self, _instance_index: &str, _update: &Value) {}
    async fn on_symbol_prices_updated(&self, _instance_index: &str, _prices: &Value) {}
    async fn on_deal_synchronization_finished(&self, _instance_index: &str, _synchronization_id: &str) {}
    async fn on_order_synchronization_finished(&self, _instance_index: &str, _synchronization_id: &str) {}
    async fn on_subscription_downgraded(&self, _instance_index: &str, _payload: &Value) {}
}

#[async_trait]
pub trait LatencyListener: Send + Sync {
    async fn on_update(&self, _account_id: &str, _update: &Value) {}
    async fn on_symbol_price(&self, _account_id: &str, _price: &Value) {}
}

#[async_trait]
pub trait ReconnectListener: Send + Sync {
    async fn on_reconnected(&self, _account_id: &str) {}
}

type SyncListeners = Arc<DashMap<String, Vec<Arc<dyn SynchronizationListener>>>>;
type ReconnectListeners = Arc<DashMap<String, Vec<Arc<dyn ReconnectListener>>>>;

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    synchronization: SyncListeners,
    latency: Arc<parking_lot::Mutex<Vec<Arc<dyn LatencyListener>>>>,
    reconnect: ReconnectListeners,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_synchronization_listener(&self, account_id: &str, listener: Arc<dyn SynchronizationListener>) {
        let mut entry = self.synchronization.entry(account_id.to_string()).or_default();
        if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entry.push(listener);
        }
    }

    pub fn remove_synchronization_listener(&self, account_id: &str, listener: &Arc<dyn SynchronizationListener>) {
        if let Some(mut entry) = self.synchronization.get_mut(account_id) {
            entry.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    pub fn synchronization_listeners(&self, account_id: &str) -> Vec<Arc<dyn SynchronizationListener>> {
        self.synchronization.get(account_id).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn add_latency_listener(&self, listener: Arc<dyn LatencyListener>) {
        let mut listeners = self.latency.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn latency_listeners(&self) -> Vec<Arc<dyn LatencyListener>> {
        self.latency.lock().clone()
    }

    pub fn add_reconnect_listener(&self, account_id: &str, listener: Arc<dyn ReconnectListener>) {
        let mut entry = self.reconnect.entry(account_id.to_string()).or_default();
        if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entry.push(listener);
        }
    }

    pub fn reconnect_listeners_for(&self, account_id: &str) -> Vec<Arc<dyn ReconnectListener>> {
        self.reconnect.get(account_id).map(|v| v.clone()).unwrap_or_default()
    }

    /// Resets all registries — used by tests.
    pub fn remove_all_listeners(&self) {
        self.synchronization.clear();
        self.latency.lock().clear();
        self.reconnect.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    #[async_trait]
    impl SynchronizationListener for Noop {}

    #[test]
    fn registration_is_idempotent() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn SynchronizationListener> = Arc::new(Noop);
        registry.add_synchronization_listener("A", listener.clone());
        registry.add_synchronization_listener("A", listener.clone());
        assert_eq!(registry.synchronization_listeners("A").len(), 1);
    }

    #[test]
    fn remove_all_clears_everything() {
        let registry = ListenerRegistry::new();
        registry.add_synchronization_listener("A", Arc::new(Noop));
        registry.remove_all_listeners();
        assert!(registry.synchronization_listeners("A").is_empty());
    }
}
