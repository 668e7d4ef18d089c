//! RPC Multiplexer (C6, spec §4.6): correlates outbound requests with
//! inbound responses by request id, with a retry policy layered over a
//! single-attempt write.

use crate::clock::SharedClock;
use crate::config::ClientOptions;
use crate::error::GatewayError;
use crate::model::AccountId;
use crate::retry::cumulative_delay;
use crate::socket_pool::SocketPool;
use std::sync::Arc;
use std::time::Duration;
use uuid_shim::new_request_id;

mod uuid_shim {
    use rand::Rng;

    pub fn new_request_id() -> String {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 16] = rng.r#gen();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

pub struct RpcMultiplexer {
    pool: Arc<SocketPool>,
    options: ClientOptions,
    clock: SharedClock,
}

impl RpcMultiplexer {
    pub fn new(pool: Arc<SocketPool>, options: ClientOptions, clock: SharedClock) -> Self {
        Self { pool, options, clock }
    }

    /// Performs one RPC call end to end (spec §4.6): ensures placement,
    /// waits for connect, then retries per the request type's policy.
    pub async fn call(
        &self,
        account_id: &AccountId,
        request_type: &str,
        mut extra: serde_json::Map<String, serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, GatewayError> {
        let socket = self.pool.assign(account_id).await?;
        socket.wait_connected(self.options.connect_timeout).await?;

        if request_type == "subscribe" {
            extra.insert("sessionId".into(), serde_json::Value::String(socket.session_id.read().clone()));
        }

        if request_type == "synchronize"
            && let Some(sync_id) = extra.get("requestId").and_then(|v| v.as_str()).map(str::to_string)
        {
            socket.throttler.schedule_synchronize(account_id.clone(), sync_id).await;
        }

        if matches!(request_type, "trade" | "subscribe" | "synchronize") {
            return self.make_request(account_id, request_type, extra, timeout).await;
        }

        let retries = self.options.retry_opts.retries;
        let min_delay = self.options.retry_opts.min_delay;
        let max_delay = self.options.retry_opts.max_delay;
        let mut attempt = 0u32;

        loop {
            if self.pool.socket_index_for(account_id) != Some(socket.index) {
                return Err(GatewayError::ConnectionClosed);
            }

            match self.make_request(account_id, request_type, extra.clone(), timeout).await {
                Ok(value) => return Ok(value),
                Err(GatewayError::TooManyRequests { message, metadata: Some(meta) }) => {
                    let remaining = retries.saturating_sub(attempt);
                    let cumulative = cumulative_delay(attempt, remaining, min_delay, max_delay);
                    let now = self.clock.now();
                    if now + cumulative > meta.recommended_retry_time && attempt < retries {
                        let sleep_for = meta
                            .recommended_retry_time
                            .duration_since(now)
                            .unwrap_or(Duration::ZERO);
                        tokio::time::sleep(sleep_for).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::TooManyRequests {
                        message,
                        metadata: Some(meta),
                    });
                }
                Err(err) if err.is_generically_retriable() && attempt < retries => {
                    let delay = crate::clock::exponential_backoff(attempt, min_delay, max_delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Single-attempt write: registers the pending completion gate,
    /// emits the request, and waits up to `timeout` (default
    /// `requestTimeout`).
    async fn make_request(
        &self,
        account_id: &AccountId,
        request_type: &str,
        mut extra: serde_json::Map<String, serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, GatewayError> {
        let socket = self.pool.assign(account_id).await?;
        let request_id = extra
            .remove("requestId")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(new_request_id);
        extra
            .entry("timestamps".to_string())
            .or_insert_with(|| serde_json::json!({}));
        if let Some(ts) = extra.get_mut("timestamps").and_then(|v| v.as_object_mut()) {
            ts.insert(
                "clientProcessingStarted".into(),
                serde_json::Value::String(crate::model::format_timestamp(self.clock.now())),
            );
        }

        let rx = socket.register_pending(request_id.clone(), request_type.to_string());

        let mut payload = serde_json::Map::new();
        payload.insert("accountId".into(), serde_json::Value::String(account_id.clone()));
        payload.insert("requestId".into(), serde_json::Value::String(request_id.clone()));
        payload.insert("type".into(), serde_json::Value::String(request_type.to_string()));
        payload.insert("application".into(), serde_json::Value::String(self.options.application.clone()));
        payload.extend(extra);

        if let Err(e) = socket.emit(serde_json::Value::Object(payload)).await {
            socket.remove_pending(&request_id);
            return Err(e);
        }

        let wait_for = timeout.unwrap_or(self.options.request_timeout);
        match tokio::time::timeout(wait_for, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                socket.remove_pending(&request_id);
                Err(GatewayError::Timeout {
                    message: format!("request {request_type} timed out"),
                })
            }
        }
    }
}
