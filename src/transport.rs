//! Transport abstraction: a bidirectional, event-oriented connection to
//! the gateway (spec §6). Grounded on the teacher's `Channel` trait
//! shape (id/peer/shutdown) but adapted to frame-oriented JSON events
//! rather than raw byte buffers, since the wire protocol here is framed
//! JSON over WebSocket rather than a byte stream the caller chunks
//! itself.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    Closed,
}

/// One inbound frame off the wire, tagged by the outer envelope
/// `type` field (spec §6): `response`, `processingError`, or
/// `synchronization`.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub raw: String,
}

/// A bidirectional event transport: `emit` sends one JSON-encodable
/// outbound event, `frames()` is the receive side.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn emit(&self, payload: serde_json::Value) -> Result<(), TransportError>;
    async fn close(&self);
    fn is_connected(&self) -> bool;
}

/// Connects a [`Transport`] to `url`, authenticating via query
/// parameters per spec §6 (`auth-token`, `clientId`, `protocol=2`) and
/// the `Client-Id` header.
pub async fn connect_websocket(
    url: &str,
    token: &str,
    client_id: &str,
    connect_timeout: Duration,
) -> Result<(WsTransport, mpsc::UnboundedReceiver<InboundFrame>), TransportError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let full_url = format!("{url}/ws?auth-token={token}&clientId={client_id}&protocol=2");
    let mut request = full_url
        .into_client_request()
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
    request
        .headers_mut()
        .insert("Client-Id", client_id.parse().map_err(|_| TransportError::ConnectFailed("bad client id".into()))?);

    let connect = tokio_tungstenite::connect_async(request);
    let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| TransportError::ConnectTimeout)?
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let connected = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));

    let connected_writer = connected.clone();
    tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if write.send(Message::Text(text)).await.is_err() {
                connected_writer.store(false, std::sync::atomic::Ordering::SeqCst);
                break;
            }
        }
    });

    let connected_reader = connected.clone();
    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if frame_tx.send(InboundFrame { raw: text.to_string() }).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => {
                    connected_reader.store(false, std::sync::atomic::Ordering::SeqCst);
                    break;
                }
                _ => {}
            }
        }
        connected_reader.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    Ok((
        WsTransport {
            outbound_tx,
            connected,
        },
        frame_rx,
    ))
}

pub struct WsTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit(&self, payload: serde_json::Value) -> Result<(), TransportError> {
        let text = serde_json::to_string(&payload).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.outbound_tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }
}
