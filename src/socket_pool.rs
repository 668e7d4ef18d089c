//! Socket Pool (C5, spec §4.5): owns N transport connections, places
//! accounts onto sockets under capacity/lock constraints, reconnects.

use crate::clock::SharedClock;
use crate::config::ClientOptions;
use crate::error::{GatewayError, RateLimitKind, RateLimitMetadata};
use crate::model::{AccountId, SubscribeLock};
use crate::throttler::SynchronizationThrottler;
use crate::transport::{self, InboundFrame, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::DashSet;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

/// Produces a connected [`Transport`] plus its inbound frame stream for
/// one socket. The production path (`WsConnector`) dials a real
/// WebSocket; tests substitute an in-memory connector so the pool's
/// placement/reconnect/lock machinery runs without a live gateway.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        client_id: &str,
        timeout: Duration,
    ) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<InboundFrame>), GatewayError>;
}

pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        client_id: &str,
        timeout: Duration,
    ) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<InboundFrame>), GatewayError> {
        let (ws, frames) = transport::connect_websocket(url, token, client_id, timeout).await?;
        Ok((Arc::new(ws) as Arc<dyn Transport>, frames))
    }
}

pub struct PendingRequest {
    pub request_type: String,
    pub completion: oneshot::Sender<Result<serde_json::Value, GatewayError>>,
}

/// One long-lived transport connection, carrying up to
/// `MaxAccountsPerInstance` accounts (spec §3).
pub struct SocketInstance {
    pub index: usize,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pub session_id: RwLock<String>,
    pending: DashMap<String, PendingRequest>,
    pub assigned_accounts: DashSet<AccountId>,
    pub throttler: Arc<SynchronizationThrottler>,
    per_socket_lock: RwLock<Option<SubscribeLock>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    connect_notify: Notify,
}

impl SocketInstance {
    fn new(index: usize, throttler: Arc<SynchronizationThrottler>) -> Arc<Self> {
        Arc::new(Self {
            index,
            transport: RwLock::new(None),
            session_id: RwLock::new(String::new()),
            pending: DashMap::new(),
            assigned_accounts: DashSet::new(),
            throttler,
            per_socket_lock: RwLock::new(None),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            connect_notify: Notify::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), GatewayError> {
        if self.is_connected() {
            return Ok(());
        }
        tokio::time::timeout(timeout, self.connect_notify.notified())
            .await
            .map_err(|_| GatewayError::Timeout {
                message: "waiting for connect result".into(),
            })?;
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::Timeout {
                message: "socket failed to connect".into(),
            })
        }
    }

    pub fn subscribed_count(&self) -> usize {
        self.assigned_accounts.len()
    }

    pub fn register_pending(&self, request_id: String, request_type: String) -> oneshot::Receiver<Result<serde_json::Value, GatewayError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRequest {
                request_type,
                completion: tx,
            },
        );
        rx
    }

    pub fn remove_pending(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn complete_pending(&self, request_id: &str, result: Result<serde_json::Value, GatewayError>) {
        if let Some((_, pending)) = self.pending.remove(request_id) {
            let _ = pending.completion.send(result);
        }
    }

    pub async fn emit(&self, payload: serde_json::Value) -> Result<(), GatewayError> {
        let transport = self.transport.read().clone();
        match transport {
            Some(t) if self.is_connected() => {
                t.emit(payload).await.map_err(|_| GatewayError::ConnectionClosed)
            }
            _ => Err(GatewayError::ConnectionClosed),
        }
    }

    pub fn per_socket_lock(&self) -> Option<SubscribeLock> {
        self.per_socket_lock.read().clone()
    }

    pub fn set_per_socket_lock(&self, lock: SubscribeLock) {
        *self.per_socket_lock.write() = Some(lock);
    }

    fn fail_all_pending(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.complete_pending(&key, Err(GatewayError::ConnectionClosed));
        }
    }
}

fn random_client_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:010}", rng.gen_range(0..10_000_000_000u64))
}

/// Pool-wide lock state (global scope of [`SubscribeLock`]) plus the
/// per-socket instances.
pub struct SocketPool {
    options: ClientOptions,
    clock: SharedClock,
    url: String,
    token: String,
    connector: Arc<dyn Connector>,
    sockets: RwLock<Vec<Arc<SocketInstance>>>,
    global_lock: RwLock<Option<SubscribeLock>>,
    account_socket: DashMap<AccountId, usize>,
    pub frame_tx: mpsc::UnboundedSender<(usize, InboundFrame)>,
}

impl SocketPool {
    pub fn new(
        options: ClientOptions,
        clock: SharedClock,
        url: String,
        token: String,
        frame_tx: mpsc::UnboundedSender<(usize, InboundFrame)>,
    ) -> Arc<Self> {
        Self::new_with_connector(options, clock, url, token, frame_tx, Arc::new(WsConnector))
    }

    pub fn new_with_connector(
        options: ClientOptions,
        clock: SharedClock,
        url: String,
        token: String,
        frame_tx: mpsc::UnboundedSender<(usize, InboundFrame)>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            clock,
            url,
            token,
            connector,
            sockets: RwLock::new(Vec::new()),
            global_lock: RwLock::new(None),
            account_socket: DashMap::new(),
            frame_tx,
        })
    }

    /// Creates and connects a fresh socket instance, registering its
    /// frame-reader loop to forward inbound frames to `frame_tx`.
    pub async fn connect_new_socket(&self) -> Result<Arc<SocketInstance>, GatewayError> {
        let index = {
            let mut sockets = self.sockets.write();
            let index = sockets.len();
            sockets.push(SocketInstance::new(
                index,
                Arc::new(SynchronizationThrottler::new(
                    self.clock.clone(),
                    self.options.synchronization_throttler.max_concurrent_synchronizations,
                )),
            ));
            index
        };
        self.reconnect(index).await?;
        Ok(self.sockets.read()[index].clone())
    }

    pub fn socket(&self, index: usize) -> Option<Arc<SocketInstance>> {
        self.sockets.read().get(index).cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.read().len()
    }

    /// (Re)connects socket `index`: disconnects the old transport (if
    /// any), generates a fresh session id and client id, and connects.
    pub async fn reconnect(&self, index: usize) -> Result<(), GatewayError> {
        let socket = self
            .sockets
            .read()
            .get(index)
            .cloned()
            .ok_or(GatewayError::ConnectionClosed)?;

        if socket
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        struct Guard<'a>(&'a AtomicBool);
        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let _guard = Guard(&socket.reconnecting);

        socket.connected.store(false, Ordering::SeqCst);
        socket.fail_all_pending();

        let client_id = random_client_id();
        let session_id = uuid_like();
        *socket.session_id.write() = session_id;

        let (transport, mut frames) = self
            .connector
            .connect(&self.url, &self.token, &client_id, self.options.connect_timeout)
            .await?;
        *socket.transport.write() = Some(transport);
        socket.connected.store(true, Ordering::SeqCst);
        socket.connect_notify.notify_waiters();

        let frame_tx = self.frame_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if frame_tx.send((index, frame)).is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    /// Places `account_id` onto a socket under capacity/lock
    /// constraints (spec §4.5), connecting a new socket if none has
    /// room.
    pub async fn assign(&self, account_id: &str) -> Result<Arc<SocketInstance>, GatewayError> {
        if let Some(entry) = self.account_socket.get(account_id)
            && let Some(socket) = self.socket(*entry)
        {
            return Ok(socket);
        }

        self.wait_out_global_lock().await;

        let sockets = self.sockets.read().clone();
        for socket in &sockets {
            if let Some(lock) = socket.per_socket_lock()
                && self.socket_is_locked(&lock, socket)
            {
                continue;
            }
            if socket.subscribed_count() < self.options.max_accounts_per_instance {
                socket.assigned_accounts.insert(account_id.to_string());
                self.account_socket.insert(account_id.to_string(), socket.index);
                return Ok(socket.clone());
            }
        }

        let socket = self.connect_new_socket().await?;
        socket.assigned_accounts.insert(account_id.to_string());
        self.account_socket.insert(account_id.to_string(), socket.index);
        Ok(socket)
    }

    async fn wait_out_global_lock(&self) {
        loop {
            let lock = self.global_lock.read().clone();
            let Some(SubscribeLock::Global {
                recommended_retry_time,
                locked_at_accounts,
                locked_at_time,
            }) = lock
            else {
                return;
            };
            let now = self.clock.now();
            let subscribed = self.account_socket.len();
            let retry_passed_and_room = now > recommended_retry_time && subscribed < locked_at_accounts;
            let cooldown_elapsed = now
                > locked_at_time + self.options.retry_opts.subscribe_cooldown
                && subscribed >= locked_at_accounts;
            if retry_passed_and_room || cooldown_elapsed {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Table from spec §4.5: whether placement should skip a socket
    /// carrying the given per-socket lock.
    fn socket_is_locked(&self, lock: &SubscribeLock, socket: &SocketInstance) -> bool {
        let SubscribeLock::PerSocket {
            kind,
            recommended_retry_time,
            locked_at_accounts,
        } = lock
        else {
            return false;
        };
        let now = self.clock.now();
        let subscribed = socket.subscribed_count();
        match kind {
            RateLimitKind::PerUserPerServer => now < *recommended_retry_time || subscribed >= *locked_at_accounts,
            RateLimitKind::PerServer => now < *recommended_retry_time && subscribed >= *locked_at_accounts,
            RateLimitKind::PerUser => false,
        }
    }

    /// Records a lock signalled by a `TooManyRequests` error (spec
    /// §4.4/§4.5). Global locks apply pool-wide; per-socket locks apply
    /// to one socket unless it currently carries zero accounts, in
    /// which case it's force-reconnected instead (a lock on an empty
    /// socket is assumed stale).
    pub async fn lock_socket_instance(&self, index: usize, metadata: RateLimitMetadata) {
        let now = self.clock.now();
        if metadata.kind == RateLimitKind::PerUser {
            *self.global_lock.write() = Some(SubscribeLock::Global {
                recommended_retry_time: metadata.recommended_retry_time,
                locked_at_accounts: metadata.locked_at_accounts,
                locked_at_time: now,
            });
            return;
        }

        let Some(socket) = self.socket(index) else { return };
        if socket.subscribed_count() == 0 {
            let _ = self.reconnect(index).await;
            return;
        }
        socket.set_per_socket_lock(SubscribeLock::PerSocket {
            kind: metadata.kind,
            recommended_retry_time: metadata.recommended_retry_time,
            locked_at_accounts: metadata.locked_at_accounts,
        });
    }

    pub fn unassign(&self, account_id: &str) {
        if let Some((_, index)) = self.account_socket.remove(account_id)
            && let Some(socket) = self.socket(index)
        {
            socket.assigned_accounts.remove(account_id);
        }
    }

    pub fn socket_index_for(&self, account_id: &str) -> Option<usize> {
        self.account_socket.get(account_id).map(|e| *e)
    }

    /// Marks all instances disconnected, fails all pending requests,
    /// and drops account assignments (spec §4.5 `close()`).
    pub async fn close(&self) {
        let sockets = self.sockets.read().clone();
        for socket in sockets {
            socket.connected.store(false, Ordering::SeqCst);
            socket.fail_all_pending();
            let transport = socket.transport.read().clone();
            if let Some(t) = transport {
                t.close().await;
            }
        }
        self.account_socket.clear();
    }
}

fn uuid_like() -> String {
    let mut rng = rand::thread_rng();
    let a: u64 = rng.r#gen();
    let b: u64 = rng.r#gen();
    format!("{a:016x}{b:016x}")
}
