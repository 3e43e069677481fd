//! WebSocket Transport + Service Manager — the event bus connecting a
//! running `AgentManager` to a remote control plane.
//!
//! Grounded in `original_source/src/cue/services/transport/websocket_transport.py`
//! (connect/reconnect/heartbeat semantics) and
//! `original_source/src/cue/types/event_message.py` (the `EventMessage`
//! envelope). Per REDESIGN FLAGS, the original's module-level
//! `ServiceManager`/scheduler singletons become an explicit `Services`
//! bundle built once by the caller and `Arc`-cloned into constructors.

use crate::error::{ErrorReport, ErrorType, MonitoringClient, Severity, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventMessageType {
    Generic,
    User,
    Assistant,
    ClientConnect,
    ClientDisconnect,
    ClientStatus,
    Ping,
    Pong,
    Error,
    Message,
    MessageChunk,
    AgentState,
    AgentControl,
    AgentEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub event_type: Option<EventMessageType>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_request_id: Option<String>,
}

impl EventMessage {
    pub fn new(event_type: EventMessageType, payload: serde_json::Value) -> Self {
        Self {
            event_type: Some(event_type),
            payload,
            client_id: None,
            metadata: None,
            websocket_request_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Connection metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub connection_attempts: AtomicU64,
    pub successful_messages_sent: AtomicU64,
    pub failed_messages: AtomicU64,
    last_connected_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    last_disconnected_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct TransportMetricsSnapshot {
    pub connection_attempts: u64,
    pub successful_messages_sent: u64,
    pub failed_messages: u64,
    pub last_connected_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_disconnected_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// WsConnection
// ---------------------------------------------------------------------------

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_MISSED_HEARTBEATS: u32 = 3;
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const DEFAULT_QUEUE_SIZE: usize = 1000;

enum OutboundFrame {
    Text(String),
    Ping,
}

/// SPEC §4.H boundary behavior: a `{error, code: 429}` payload is swallowed
/// before it reaches any handler, never forwarded on the inbound channel.
fn is_rate_limited(event: &EventMessage) -> bool {
    event.payload.get("code").and_then(|c| c.as_u64()) == Some(429)
        && event.payload.get("error").is_some()
}

/// A single managed WebSocket connection: `ws://<host>/ws/<client_id>[?runner_id=…]`,
/// authenticated via the `X-API-Key` header. Three cooperating tasks run
/// once connected: a reader (drains inbound frames into `inbound_tx`), a
/// heartbeat (ping every 60s, 20s pong timeout, reconnect after 3 misses),
/// and the connect/reconnect loop itself (exponential backoff capped at
/// 5 minutes, ±10% jitter; a 401 response fails immediately with no retry).
pub struct WsConnection {
    ws_url: String,
    client_id: String,
    api_key: String,
    runner_id: Option<String>,
    connected: Arc<AtomicBool>,
    outbound: Arc<Mutex<mpsc::Sender<OutboundFrame>>>,
    // Shared so the writer task spawned per-connect can hand the receiver
    // back to the slot once its sink dies, letting the next `connect()`
    // resume draining the same long-lived queue instead of losing it.
    outbound_rx_slot: Arc<Mutex<Option<mpsc::Receiver<OutboundFrame>>>>,
    inbound_tx: mpsc::UnboundedSender<EventMessage>,
    last_pong: Arc<Mutex<std::time::Instant>>,
    metrics: Arc<TransportMetrics>,
    monitoring: Mutex<Option<Arc<dyn MonitoringClient>>>,
}

impl WsConnection {
    pub fn new(
        ws_url: impl Into<String>,
        client_id: impl Into<String>,
        api_key: impl Into<String>,
        runner_id: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<EventMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(DEFAULT_QUEUE_SIZE);
        let conn = Self {
            ws_url: ws_url.into(),
            client_id: client_id.into(),
            api_key: api_key.into(),
            runner_id,
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Arc::new(Mutex::new(outbound_tx)),
            outbound_rx_slot: Arc::new(Mutex::new(Some(outbound_rx))),
            inbound_tx,
            last_pong: Arc::new(Mutex::new(std::time::Instant::now())),
            metrics: Arc::new(TransportMetrics::default()),
            monitoring: Mutex::new(None),
        };
        (conn, inbound_rx)
    }

    /// Attach a monitoring collaborator. Connect failures (SPEC §4.H/§7
    /// "recoverable I/O... reported to monitoring if available") are
    /// reported through it once set.
    pub async fn set_monitoring(&self, monitoring: Arc<dyn MonitoringClient>) {
        *self.monitoring.lock().await = Some(monitoring);
    }

    async fn report_connect_failure(&self, message: &str) {
        if let Some(monitoring) = self.monitoring.lock().await.as_ref() {
            let report = ErrorReport::new(ErrorType::System, message.to_string())
                .with_severity(Severity::Warning)
                .with_metadata(serde_json::json!({ "component": "transport", "client_id": self.client_id }));
            monitoring.report_error(&report).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn metrics(&self) -> TransportMetricsSnapshot {
        TransportMetricsSnapshot {
            connection_attempts: self.metrics.connection_attempts.load(Ordering::Relaxed),
            successful_messages_sent: self.metrics.successful_messages_sent.load(Ordering::Relaxed),
            failed_messages: self.metrics.failed_messages.load(Ordering::Relaxed),
            last_connected_at: *self.metrics.last_connected_at.lock().await,
            last_disconnected_at: *self.metrics.last_disconnected_at.lock().await,
            last_error: self.metrics.last_error.lock().await.clone(),
        }
    }

    fn url(&self) -> String {
        let mut url = format!("{}/{}", self.ws_url, self.client_id);
        if let Some(runner_id) = &self.runner_id {
            url.push_str(&format!("?runner_id={runner_id}"));
        }
        url
    }

    /// Connect once, spawning the reader and heartbeat tasks on success.
    /// Returns `TransportError::ConnectFailed` on a 401 without retrying;
    /// callers wanting retry should use `run()` instead.
    pub async fn connect(&self) -> Result<(), TransportError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        self.metrics.connection_attempts.fetch_add(1, Ordering::Relaxed);

        let mut request = self
            .url()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        request
            .headers_mut()
            .insert("X-API-Key", self.api_key.parse().unwrap());

        let connect_result = tokio_tungstenite::connect_async(request).await;
        let (ws_stream, response) = match connect_result {
            Ok(pair) => pair,
            Err(e) => {
                let msg = e.to_string();
                *self.metrics.last_error.lock().await = Some(msg.clone());
                self.report_connect_failure(&msg).await;
                return Err(TransportError::ConnectFailed(msg));
            }
        };

        if response.status().as_u16() == 401 {
            let msg = "authentication failed: invalid or expired api key";
            self.report_connect_failure(msg).await;
            return Err(TransportError::ConnectFailed(msg.into()));
        }

        self.connected.store(true, Ordering::SeqCst);
        *self.metrics.last_connected_at.lock().await = Some(chrono::Utc::now());

        let (mut write, mut read) = futures::StreamExt::split(ws_stream);

        // Re-split on every connect: a fresh writer is spawned bound to this
        // connection's `write` sink, but it drains the same long-lived
        // receiver every time — handed back into the slot by the previous
        // writer when its sink died, so messages enqueued while disconnected
        // are delivered once this writer starts (queue preserved).
        let outbound_rx = self.outbound_rx_slot.lock().await.take();
        if let Some(mut outbound_rx) = outbound_rx {
            let slot = self.outbound_rx_slot.clone();
            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let ws_frame = match frame {
                        OutboundFrame::Text(text) => WsMessage::Text(text),
                        OutboundFrame::Ping => WsMessage::Ping(Vec::new()),
                    };
                    if futures::SinkExt::send(&mut write, ws_frame).await.is_err() {
                        break;
                    }
                }
                *slot.lock().await = Some(outbound_rx);
            });
        } else {
            tracing::warn!(
                "outbound receiver still held by a previous writer; queued \
                 messages will wait for it to be freed"
            );
        }

        let inbound_tx = self.inbound_tx.clone();
        let last_pong = self.last_pong.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<EventMessage>(&text) {
                            Ok(event) if is_rate_limited(&event) => {
                                tracing::debug!("swallowing 429 event payload");
                            }
                            Ok(event) => {
                                inbound_tx.send(event).ok();
                            }
                            Err(e) => tracing::warn!(error = %e, "dropping malformed event"),
                        }
                    }
                    Ok(WsMessage::Pong(_)) => {
                        *last_pong.lock().await = std::time::Instant::now();
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    /// Send a protocol-level ping and wait up to `HEARTBEAT_TIMEOUT` for a
    /// pong, recorded by the reader task via `last_pong`.
    async fn heartbeat_tick(&self) -> bool {
        let before = std::time::Instant::now();
        if self.outbound.lock().await.try_send(OutboundFrame::Ping).is_err() {
            return false;
        }
        let deadline = before + HEARTBEAT_TIMEOUT;
        loop {
            if *self.last_pong.lock().await >= before {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Enqueue `event` for send. If the outbound queue is full, returns
    /// `TransportError::SendFailed("queue full")` rather than blocking —
    /// matches the fixed-capacity outbound queue in SPEC_FULL.md §4.H.
    pub async fn send(&self, event: &EventMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(event)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        let outbound = self.outbound.lock().await;
        match outbound.try_send(OutboundFrame::Text(text)) {
            Ok(()) => {
                self.metrics.successful_messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.metrics.failed_messages.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::SendFailed("queue full".into()))
            }
        }
    }

    /// Run the connect/heartbeat/reconnect supervisor until cancelled.
    /// Reconnects on any listener exit with exponential backoff, capped at
    /// 5 minutes with ±10% jitter; gives up immediately on auth failure.
    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect().await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                    let mut missed = 0u32;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                                if !self.is_connected() {
                                    break;
                                }
                                let ok = tokio::time::timeout(HEARTBEAT_TIMEOUT, self.heartbeat_tick())
                                    .await
                                    .unwrap_or(false);
                                if ok {
                                    missed = 0;
                                } else {
                                    missed += 1;
                                    if missed >= MAX_MISSED_HEARTBEATS {
                                        tracing::warn!("missed {missed} heartbeats, reconnecting");
                                        self.connected.store(false, Ordering::SeqCst);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    *self.metrics.last_disconnected_at.lock().await = Some(chrono::Utc::now());
                }
                Err(TransportError::ConnectFailed(msg)) if msg.contains("authentication failed") => {
                    tracing::error!("authentication failed, giving up");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connect failed, backing off");
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * 0.1;
            let sleep_for = Duration::from_secs_f64((backoff.as_secs_f64() * jitter).min(MAX_BACKOFF.as_secs_f64()));
            tokio::time::sleep(sleep_for).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

// ---------------------------------------------------------------------------
// Services bundle (explicit, not a singleton)
// ---------------------------------------------------------------------------

/// Shared collaborators built once at startup and `Arc`-cloned into every
/// constructor that needs them — `AgentManager`, tool implementations, the
/// scheduler. Replaces the original's module-level singletons per
/// REDESIGN FLAGS.
#[derive(Clone)]
pub struct Services {
    pub runtime_config: Arc<crate::config::RuntimeConfig>,
    pub connection: Arc<WsConnection>,
}

/// Routes inbound `EventMessage`s by type and exposes the outbound
/// broadcast API (`send_message_to_assistant`/`send_message_to_user`/
/// `broadcast_client_status`). A handler for an event type not in the
/// table is logged and dropped, matching the Boundary Behavior in
/// SPEC_FULL.md §6.
pub struct ServiceManager {
    services: Services,
    handlers: RwLock<
        std::collections::HashMap<
            EventMessageType,
            Arc<dyn Fn(EventMessage) + Send + Sync>,
        >,
    >,
}

impl ServiceManager {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            handlers: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn on_event(
        &self,
        event_type: EventMessageType,
        handler: Arc<dyn Fn(EventMessage) + Send + Sync>,
    ) {
        self.handlers.write().await.insert(event_type, handler);
    }

    pub async fn route(&self, event: EventMessage) {
        let Some(event_type) = event.event_type else {
            tracing::warn!("dropping event with no type");
            return;
        };
        let handlers = self.handlers.read().await;
        match handlers.get(&event_type) {
            Some(handler) => handler(event),
            None => tracing::debug!(?event_type, "no handler registered, dropping event"),
        }
    }

    pub async fn send_message_to_assistant(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let event = EventMessage::new(
            EventMessageType::Assistant,
            serde_json::json!({ "message": text.into() }),
        );
        self.services.connection.send(&event).await
    }

    pub async fn send_message_to_user(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let event = EventMessage::new(
            EventMessageType::User,
            serde_json::json!({ "message": text.into() }),
        );
        self.services.connection.send(&event).await
    }

    pub async fn broadcast_client_status(&self, status: impl Into<String>) -> Result<(), TransportError> {
        let event = EventMessage::new(
            EventMessageType::ClientStatus,
            serde_json::json!({ "status": status.into() }),
        );
        self.services.connection.send(&event).await
    }

    /// GET `/health` with a 10s timeout, per SPEC_FULL.md §6's Health
    /// endpoint contract.
    pub async fn health_check(&self, base_url: &str) -> bool {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build();
        let Ok(client) = client else { return false };
        client
            .get(format!("{base_url}/health"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_message_round_trip() {
        let event = EventMessage::new(EventMessageType::Ping, serde_json::json!({}))
            .with_client_id("client-1");
        let json = serde_json::to_string(&event).unwrap();
        let back: EventMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, Some(EventMessageType::Ping));
        assert_eq!(back.client_id.as_deref(), Some("client-1"));
    }

    #[test]
    fn test_unknown_event_type_is_dropped_not_error() {
        // A payload with an unrecognized "type" string should fail to
        // deserialize into EventMessageType and the caller drops it,
        // rather than the whole EventMessage parse aborting the connection.
        let raw = serde_json::json!({ "type": "made_up", "payload": {} });
        let parsed: Result<EventMessage, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_send_fails_when_queue_full() {
        let (conn, _rx) = WsConnection::new("ws://localhost/ws", "client-1", "key", None);
        // Outbound channel has capacity DEFAULT_QUEUE_SIZE but no reader is
        // draining it (connect() was never called), so it fills up.
        let mut last = Ok(());
        for _ in 0..(DEFAULT_QUEUE_SIZE + 1) {
            last = conn
                .send(&EventMessage::new(EventMessageType::Generic, serde_json::json!({})))
                .await;
        }
        assert!(last.is_err());
    }

    #[test]
    fn test_429_payload_is_rate_limited() {
        let event = EventMessage::new(
            EventMessageType::Error,
            serde_json::json!({ "error": "too many requests", "code": 429 }),
        );
        assert!(is_rate_limited(&event));
    }

    #[test]
    fn test_non_429_payload_is_not_rate_limited() {
        let event = EventMessage::new(EventMessageType::Error, serde_json::json!({ "code": 500 }));
        assert!(!is_rate_limited(&event));

        let no_code = EventMessage::new(EventMessageType::Generic, serde_json::json!({}));
        assert!(!is_rate_limited(&no_code));
    }

    #[tokio::test]
    async fn test_outbound_rx_slot_is_reusable_after_take() {
        // Simulates what the writer task does across a reconnect: take the
        // receiver, use it, then hand it back so the next connect() can
        // take it again instead of permanently losing the queue.
        let (conn, _rx) = WsConnection::new("ws://localhost/ws", "client-1", "key", None);
        let taken = conn.outbound_rx_slot.lock().await.take();
        assert!(taken.is_some());
        assert!(conn.outbound_rx_slot.lock().await.is_none());

        *conn.outbound_rx_slot.lock().await = taken;
        assert!(conn.outbound_rx_slot.lock().await.is_some());
    }
}
