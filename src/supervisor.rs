//! Subscription Supervisor (C4, spec §4.4): a long-running subscribe
//! loop per `accountId:instanceNumber`, with exponential backoff,
//! cancellation, and rate-limit-driven pauses.

use crate::clock::SharedClock;
use crate::config::ClientOptions;
use crate::error::{GatewayError, RateLimitKind};
use crate::model::{AccountId, InstancePrefix};
use crate::rpc::RpcMultiplexer;
use crate::socket_pool::SocketPool;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

struct SupervisorEntry {
    should_retry: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct SubscriptionSupervisor {
    options: ClientOptions,
    clock: SharedClock,
    rpc: Arc<RpcMultiplexer>,
    pool: Arc<SocketPool>,
    entries: DashMap<InstancePrefix, SupervisorEntry>,
}

impl SubscriptionSupervisor {
    pub fn new(options: ClientOptions, clock: SharedClock, rpc: Arc<RpcMultiplexer>, pool: Arc<SocketPool>) -> Arc<Self> {
        Arc::new(Self {
            options,
            clock,
            rpc,
            pool,
            entries: DashMap::new(),
        })
    }

    /// Starts (or leaves running, if one's already in flight) the
    /// subscribe loop for this account/instance (spec §4.4 invariant:
    /// at most one supervisor loop per `accountId:instanceNumber`).
    pub fn schedule_subscribe(self: &Arc<Self>, account_id: AccountId, instance_number: u32) {
        let prefix = InstancePrefix {
            account_id: account_id.clone(),
            instance_number,
        };
        if self.entries.contains_key(&prefix) {
            return;
        }

        let should_retry = Arc::new(AtomicBool::new(true));
        let cancel = Arc::new(Notify::new());

        let this = self.clone();
        let sr = should_retry.clone();
        let cn = cancel.clone();
        let handle = tokio::spawn(async move {
            this.run_loop(account_id, instance_number, sr, cn).await;
        });

        self.entries.insert(
            prefix,
            SupervisorEntry {
                should_retry,
                cancel,
                handle,
            },
        );
    }

    async fn run_loop(self: Arc<Self>, account_id: AccountId, instance_number: u32, should_retry: Arc<AtomicBool>, cancel: Arc<Notify>) {
        let mut backoff = Duration::from_secs(3);

        loop {
            if !should_retry.load(Ordering::SeqCst) {
                break;
            }

            let mut extra = serde_json::Map::new();
            extra.insert("instanceIndex".into(), serde_json::Value::from(instance_number));
            let result = self.rpc.call(&account_id, "subscribe", extra, Some(self.options.request_timeout)).await;

            match result {
                Ok(_) => {}
                Err(GatewayError::TooManyRequests { metadata: Some(meta), .. }) => {
                    match meta.kind {
                        RateLimitKind::PerUser => {
                            tracing::warn!(account_id, "subscribe rate-limited pool-wide");
                            self.pool.lock_socket_instance(0, meta).await;
                        }
                        RateLimitKind::PerServer | RateLimitKind::PerUserPerServer => {
                            if let Some(index) = self.pool.socket_index_for(&account_id) {
                                self.pool.unassign(&account_id);
                                let retry_time = meta.recommended_retry_time;
                                self.pool.lock_socket_instance(index, meta).await;
                                let now = self.clock.now();
                                let natural = backoff;
                                let until_retry = retry_time.duration_since(now).unwrap_or(Duration::ZERO);
                                if until_retry > natural {
                                    tokio::select! {
                                        _ = tokio::time::sleep(until_retry) => {}
                                        _ = cancel.notified() => break,
                                    }
                                }
                            }
                        }
                    }
                }
                Err(other) => {
                    tracing::debug!(account_id, error = %other, "subscribe attempt failed, will retry");
                }
            }

            if !should_retry.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.notified() => break,
            }
            backoff = exponential_backoff_step(backoff);
        }
    }

    /// Stops the supervisor loop for `accountId:instanceNumber` (spec
    /// §4.4 `cancelSubscribe`). Idempotent.
    pub fn cancel_subscribe(&self, account_id: &str, instance_number: u32) {
        let prefix = InstancePrefix {
            account_id: account_id.to_string(),
            instance_number,
        };
        if let Some((_, entry)) = self.entries.remove(&prefix) {
            entry.should_retry.store(false, Ordering::SeqCst);
            entry.cancel.notify_waiters();
            entry.handle.abort();
        }
    }

    pub fn cancel_account(&self, account_id: &str) {
        let prefixes: Vec<InstancePrefix> = self
            .entries
            .iter()
            .filter(|e| e.key().account_id == account_id)
            .map(|e| e.key().clone())
            .collect();
        for prefix in prefixes {
            self.cancel_subscribe(&prefix.account_id, prefix.instance_number);
        }
    }

    /// On a status/authenticated timeout, kick off a fresh subscribe if
    /// the account is still assigned to a connected socket (spec §4.4
    /// `onTimeout`).
    pub fn on_timeout(self: &Arc<Self>, account_id: &AccountId, instance_number: u32) {
        if let Some(index) = self.pool.socket_index_for(account_id)
            && let Some(socket) = self.pool.socket(index)
            && socket.is_connected()
        {
            self.schedule_subscribe(account_id.clone(), instance_number);
        }
    }

    /// On disconnect, wait a random 1-5s jitter, then resubscribe if
    /// still assigned (spec §4.4 `onDisconnected`).
    pub fn on_disconnected(self: &Arc<Self>, account_id: AccountId, instance_number: u32) {
        let this = self.clone();
        tokio::spawn(async move {
            let jitter = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(1_000..=5_000))
            };
            tokio::time::sleep(jitter).await;
            if this.pool.socket_index_for(&account_id).is_some() {
                this.schedule_subscribe(account_id, instance_number);
            }
        });
    }

    /// Cancels every loop whose account lives on `socket_index`, then
    /// restarts subscribes for `reconnect_account_ids` once any
    /// still-running loop for that account finishes (spec §4.4
    /// `onReconnected`).
    pub fn on_reconnected(self: &Arc<Self>, socket_index: usize, reconnect_account_ids: Vec<(AccountId, u32)>) {
        let accounts_on_socket: Vec<AccountId> = self
            .pool
            .socket(socket_index)
            .map(|s| s.assigned_accounts.iter().map(|a| a.clone()).collect())
            .unwrap_or_default();
        for account_id in accounts_on_socket {
            self.cancel_account(&account_id);
        }

        for (account_id, instance_number) in reconnect_account_ids {
            self.schedule_subscribe(account_id, instance_number);
        }
    }
}

fn exponential_backoff_step(current: Duration) -> Duration {
    let doubled = current.checked_mul(2).unwrap_or(Duration::from_secs(300));
    doubled.min(Duration::from_secs(300))
}
