//! Persistent update socket.
//!
//! One WebSocket carries three kinds of traffic as JSON text frames:
//! fire-and-forget emits (both directions), client calls answered by a
//! server ack with the same id, and server pushes on the `update` and
//! `ephemeral` events. The connection task reconnects forever with capped
//! exponential backoff. Calls in flight when the connection drops fail with
//! [`SyncError::Disconnected`]; there are no per-call timers.

use crate::api::HttpApi;
use crate::config::ClientConfig;
use crate::encryption::Encryption;
use crate::error::{SyncError, SyncResult};
use crate::lock;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_protocol::UPDATES_PATH;
use tether_protocol::frame::{Frame, MAX_FRAME_BYTES, RpcAck, RpcCall, events};
use tether_protocol::rpc::{RpcMethod, scoped_method};
use tether_protocol::update::{EphemeralUpdate, UpdateEnvelope};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

const PUSH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = attempt.min(31);
        let mult = 1u64 << capped.saturating_sub(1);
        let millis = self.base.as_millis() as u64;
        let raw = millis.saturating_mul(mult);
        Duration::from_millis(raw.min(self.max.as_millis() as u64))
    }
}

/// Request/ack and emit over the live connection. Registries depend on this
/// rather than on [`SyncSocket`] directly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `event` and wait for the server's ack payload.
    async fn call(&self, event: &str, data: Value) -> SyncResult<Value>;

    /// Fire-and-forget. Returns false immediately when not connected.
    fn send(&self, event: &str, data: Value) -> bool;
}

/// Encrypted RPC addressed to a session or machine.
///
/// Params are encrypted with the target's key, sent as an `rpc-call`, and the
/// acknowledged result is decrypted and validated against `M::Result`.
pub async fn rpc<M: RpcMethod>(
    transport: &dyn Transport,
    encryption: &Encryption,
    target_id: &str,
    params: &M::Params,
) -> SyncResult<M::Result> {
    let method = scoped_method::<M>(target_id);
    let cipher = encryption
        .rpc_cipher(M::TARGET, target_id)
        .ok_or_else(|| SyncError::NotFound {
            kind: "rpc target",
            id: target_id.to_string(),
        })?;
    let params = cipher
        .encrypt_json(params)
        .map_err(|e| SyncError::encrypt(&method, e))?;
    let call = RpcCall {
        method: method.clone(),
        params,
    };
    let data = serde_json::to_value(&call).map_err(|e| SyncError::protocol(e.to_string()))?;

    let ack = transport.call(events::RPC_CALL, data).await?;
    let ack: RpcAck = serde_json::from_value(ack).map_err(|e| SyncError::Rpc {
        method: method.clone(),
        message: format!("malformed ack: {e}"),
    })?;
    if !ack.ok {
        return Err(SyncError::Rpc {
            method,
            message: ack.error.unwrap_or_else(|| "rpc failed".to_string()),
        });
    }
    let Some(result) = ack.result else {
        return Err(SyncError::Decrypt { what: method });
    };
    cipher
        .decrypt_json(&result)
        .ok_or(SyncError::Decrypt { what: method })
}

/// `http(s)://host` → `ws(s)://host/v1/updates`.
pub fn socket_url(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim_end_matches('/');
    let base = if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        bail!("unsupported endpoint scheme: {endpoint}");
    };
    Ok(format!("{base}{UPDATES_PATH}"))
}

type Handler = Arc<dyn Fn(Value) + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared connection state
// ---------------------------------------------------------------------------

struct Shared {
    url: String,
    token: String,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
    updates_tx: broadcast::Sender<UpdateEnvelope>,
    ephemeral_tx: broadcast::Sender<EphemeralUpdate>,
    handlers: Mutex<HashMap<String, Handler>>,
    /// Writer for the current connection; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<SyncResult<Value>>>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl Shared {
    fn attach(&self, writer: mpsc::UnboundedSender<Frame>) {
        *lock(&self.outbound) = Some(writer);
    }

    /// Drop the writer, then fail every call still waiting for an ack.
    /// Lock order (outbound, then pending) matches `call`.
    fn detach(&self) {
        let mut outbound = lock(&self.outbound);
        *outbound = None;
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        drop(outbound);
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing in-flight calls after disconnect");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(SyncError::Disconnected));
        }
    }

    fn dispatch(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(err = %err, "dropping malformed frame");
                return;
            }
        };
        match frame {
            Frame::Ack { id, data } => match lock(&self.pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(data));
                }
                None => tracing::debug!(id, "ack for unknown call"),
            },
            Frame::Emit { event, data } => self.dispatch_event(&event, data),
            Frame::Call { id, event, .. } => {
                tracing::debug!(id, event = %event, "ignoring server-initiated call");
            }
        }
    }

    fn dispatch_event(&self, event: &str, data: Value) {
        match event {
            events::UPDATE => match UpdateEnvelope::deserialize(&data) {
                Ok(update) => {
                    let _ = self.updates_tx.send(update);
                }
                Err(err) => tracing::warn!(err = %err, "dropping malformed update"),
            },
            events::EPHEMERAL => match EphemeralUpdate::deserialize(&data) {
                Ok(update) => {
                    let _ = self.ephemeral_tx.send(update);
                }
                Err(err) => tracing::warn!(err = %err, "dropping malformed ephemeral update"),
            },
            _ => {}
        }
        let handler = lock(&self.handlers).get(event).cloned();
        if let Some(handler) = handler {
            handler(data);
        }
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

pub struct SyncSocket {
    shared: Arc<Shared>,
    encryption: Arc<Encryption>,
    http: HttpApi,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSocket {
    pub fn new(config: &ClientConfig, encryption: Arc<Encryption>) -> Result<Self> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| anyhow!("no auth token configured"))?;
        let url = socket_url(&config.endpoint)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (updates_tx, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let (ephemeral_tx, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                token: token.clone(),
                backoff: Backoff {
                    base: config.reconnect_base_delay(),
                    max: config.reconnect_max_delay(),
                },
                state_tx,
                updates_tx,
                ephemeral_tx,
                handlers: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
            encryption,
            http: HttpApi::new(&config.endpoint, &token),
            task: Mutex::new(None),
        })
    }

    /// Start the connection task. Idempotent while the task is alive.
    pub fn connect(&self) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(connection_loop(self.shared.clone())));
    }

    /// Stop reconnecting, close the connection and fail pending calls.
    pub fn dispose(&self) {
        self.shared.cancel.cancel();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.shared.detach();
        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn updates(&self) -> broadcast::Receiver<UpdateEnvelope> {
        self.shared.updates_tx.subscribe()
    }

    pub fn ephemerals(&self) -> broadcast::Receiver<EphemeralUpdate> {
        self.shared.ephemeral_tx.subscribe()
    }

    /// Register the handler for `event`. A later registration replaces it.
    pub fn on_message<F>(&self, event: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        lock(&self.shared.handlers).insert(event.to_string(), Arc::new(handler));
    }

    pub async fn rpc<M: RpcMethod>(
        &self,
        target_id: &str,
        params: &M::Params,
    ) -> SyncResult<M::Result> {
        rpc::<M>(self, &self.encryption, target_id, params).await
    }

    /// Authenticated HTTP request against the same server.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> SyncResult<reqwest::Response> {
        self.http.execute(method, path, body).await
    }

    pub fn http(&self) -> &HttpApi {
        &self.http
    }
}

impl Drop for SyncSocket {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for SyncSocket {
    async fn call(&self, event: &str, data: Value) -> SyncResult<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let outbound = lock(&self.shared.outbound);
            let Some(writer) = outbound.as_ref() else {
                return Err(SyncError::NotConnected);
            };
            lock(&self.shared.pending).insert(id, tx);
            let frame = Frame::Call {
                id,
                event: event.to_string(),
                data,
            };
            if writer.send(frame).is_err() {
                lock(&self.shared.pending).remove(&id);
                return Err(SyncError::NotConnected);
            }
        }
        rx.await.map_err(|_| SyncError::Disconnected)?
    }

    fn send(&self, event: &str, data: Value) -> bool {
        let outbound = lock(&self.shared.outbound);
        let Some(writer) = outbound.as_ref() else {
            return false;
        };
        writer
            .send(Frame::Emit {
                event: event.to_string(),
                data,
            })
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn connection_loop(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;
    while !shared.cancel.is_cancelled() {
        shared.state_tx.send_replace(ConnectionState::Connecting);
        let result = run_connection(&shared, &mut attempt).await;
        shared.detach();
        match result {
            Ok(()) => break,
            Err(e) => {
                shared.state_tx.send_replace(ConnectionState::Error);
                tracing::warn!(url = %shared.url, attempt, err = %e, "socket connection lost, reconnecting");
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.backoff.delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.cancel.cancelled() => break,
        }
    }
    shared.state_tx.send_replace(ConnectionState::Disconnected);
    tracing::info!(url = %shared.url, "socket stopped");
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_FRAME_BYTES))
        .max_frame_size(Some(MAX_FRAME_BYTES))
}

/// Run one connection until it fails (`Err`) or the socket is disposed (`Ok`).
async fn run_connection(shared: &Shared, attempt: &mut u32) -> Result<()> {
    let mut request = shared
        .url
        .as_str()
        .into_client_request()
        .context("invalid socket url")?;
    let headers = request.headers_mut();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", shared.token)).context("invalid token")?,
    );
    headers.insert("client-type", HeaderValue::from_static("user-scoped"));

    let (ws, _) = tokio::select! {
        result = connect_async_with_config(request, Some(ws_config()), false) => {
            result.context("failed to connect")?
        }
        _ = shared.cancel.cancelled() => return Ok(()),
    };
    *attempt = 0;

    let (mut sink, mut stream) = ws.split();
    let (writer, mut outbound) = mpsc::unbounded_channel::<Frame>();
    shared.attach(writer);
    shared.state_tx.send_replace(ConnectionState::Connected);
    tracing::info!(url = %shared.url, "socket connected");

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    bail!("outbound channel closed");
                };
                let text = serde_json::to_string(&frame)?;
                sink.send(Message::text(text)).await.context("socket write failed")?;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
                Some(Ok(Message::Close(_))) | None => bail!("server closed the connection"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("socket read failed"),
            },
        }
    }
}
