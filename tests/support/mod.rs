//! In-memory [`Connector`]/[`Transport`] pair that drives `GatewayClient`
//! end to end without a live gateway (SPEC_FULL.md §10.4).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tgw_client::error::GatewayError;
use tgw_client::socket_pool::Connector;
use tgw_client::transport::{InboundFrame, Transport, TransportError};
use tokio::sync::mpsc;

/// One simulated socket: outbound JSON the client `emit`s is captured in
/// `sent`; inbound frames are pushed in by the test via `push_frame`.
pub struct MockTransport {
    pub sent: Mutex<Vec<serde_json::Value>>,
    connected: AtomicBool,
    frame_tx: mpsc::UnboundedSender<InboundFrame>,
}

impl MockTransport {
    pub fn push_frame(&self, payload: serde_json::Value) {
        let _ = self.frame_tx.send(InboundFrame {
            raw: payload.to_string(),
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn emit(&self, payload: serde_json::Value) -> Result<(), TransportError> {
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out a fresh [`MockTransport`] per `connect` call and keeps a
/// handle to each one, indexed by connection order (= socket index).
#[derive(Default, Clone)]
pub struct MockConnector {
    sockets: Arc<Mutex<Vec<Arc<MockTransport>>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket(&self, index: usize) -> Arc<MockTransport> {
        self.sockets.lock()[index].clone()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn sent_requests(&self, index: usize) -> Vec<serde_json::Value> {
        self.sockets
            .lock()
            .get(index)
            .map(|t| t.sent.lock().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &str,
        _token: &str,
        _client_id: &str,
        _timeout: Duration,
    ) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<InboundFrame>), GatewayError> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            frame_tx,
        });
        self.sockets.lock().push(transport.clone());
        Ok((transport as Arc<dyn Transport>, frame_rx))
    }
}
