use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tether_protocol::UPDATES_PATH;
use tether_protocol::api::{
    ApiArtifact, ApiMachine, ApiMessage, ApiSession, CreateArtifactRequest, FriendsResponse,
    MessageContent, MessagesResponse, SessionsResponse, UserProfile, UserSearchResponse,
};
use tether_protocol::frame::{
    Frame, MAX_FRAME_BYTES, OutgoingMessage, RpcAck, RpcCall, UpdateMetadataRequest, VersionedAck, events,
};
use tether_protocol::update::{EphemeralUpdate, UpdateBody, UpdateEnvelope};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

pub const TEST_TOKEN: &str = "test-token";

type RpcHandler = Arc<dyn Fn(&str) -> RpcAck + Send + Sync>;

enum Outbound {
    Frame(Frame),
    Close,
}

/// Everything the mock server stores, plus counters the tests assert on.
#[derive(Default)]
pub struct ServerState {
    sessions: Mutex<Vec<ApiSession>>,
    messages: Mutex<HashMap<String, Vec<ApiMessage>>>,
    machines: Mutex<Vec<ApiMachine>>,
    artifacts: Mutex<Vec<ApiArtifact>>,
    friends: Mutex<Vec<UserProfile>>,
    rpc: Mutex<HashMap<String, RpcHandler>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<Outbound>>>,
    received: Mutex<Vec<OutgoingMessage>>,
    seq: AtomicU64,
    message_ids: AtomicU64,
    session_lists: AtomicUsize,
    session_list_failures: AtomicUsize,
    message_fetches: AtomicUsize,
    connections: AtomicUsize,
}

impl ServerState {
    pub fn add_session(&self, session: ApiSession) {
        self.sessions.lock().unwrap().push(session);
    }

    /// Append to a session's history (stored oldest first).
    pub fn add_message(&self, session_id: &str, message: ApiMessage) {
        self.messages
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn add_machine(&self, machine: ApiMachine) {
        self.machines.lock().unwrap().push(machine);
    }

    pub fn add_friend(&self, profile: UserProfile) {
        self.friends.lock().unwrap().push(profile);
    }

    /// Answer `rpc-call`s for `method` (`{target}:{name}`). The handler gets
    /// the encrypted params and returns the ack.
    pub fn on_rpc<F>(&self, method: &str, handler: F)
    where
        F: Fn(&str) -> RpcAck + Send + Sync + 'static,
    {
        self.rpc
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Broadcast a durable update to every connected client.
    pub fn push_update(&self, body: UpdateBody) -> UpdateEnvelope {
        let seq = self.next_seq();
        let update = UpdateEnvelope {
            id: format!("upd-{seq}"),
            seq,
            body,
            created_at: now_ms(),
        };
        self.emit(events::UPDATE, json!(update));
        update
    }

    /// Broadcast an `update` payload as-is, for frames the typed envelope
    /// cannot express.
    pub fn push_raw_update(&self, data: Value) {
        self.emit(events::UPDATE, data);
    }

    /// Answer the next `count` session list requests with 503.
    pub fn fail_session_lists(&self, count: usize) {
        self.session_list_failures.store(count, Ordering::SeqCst);
    }

    pub fn push_ephemeral(&self, update: EphemeralUpdate) {
        self.emit(events::EPHEMERAL, json!(update));
    }

    fn emit(&self, event: &str, data: Value) {
        let frame = Frame::Emit {
            event: event.to_string(),
            data,
        };
        self.clients
            .lock()
            .unwrap()
            .retain(|client| client.send(Outbound::Frame(frame.clone())).is_ok());
    }

    /// Close every socket from the server side; clients reconnect on their own.
    pub fn drop_connections(&self) {
        for client in self.clients.lock().unwrap().drain(..) {
            let _ = client.send(Outbound::Close);
        }
    }

    pub fn session_lists(&self) -> usize {
        self.session_lists.load(Ordering::SeqCst)
    }

    pub fn message_fetches(&self) -> usize {
        self.message_fetches.load(Ordering::SeqCst)
    }

    /// Number of sockets accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// `message` emits received from clients, in arrival order.
    pub fn received_messages(&self) -> Vec<OutgoingMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn stored_messages(&self, session_id: &str) -> Vec<ApiMessage> {
        self.messages
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn handle_frame(&self, text: &str, reply: &mpsc::UnboundedSender<Outbound>) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(err = %err, "mock server got a malformed frame");
                return;
            }
        };
        match frame {
            Frame::Emit { event, data } if event == events::MESSAGE => {
                match serde_json::from_value::<OutgoingMessage>(data) {
                    Ok(message) => self.accept_message(message),
                    Err(err) => tracing::warn!(err = %err, "bad message emit"),
                }
            }
            Frame::Call { id, event, data } => {
                let data = self.handle_call(&event, data);
                let _ = reply.send(Outbound::Frame(Frame::Ack { id, data }));
            }
            _ => {}
        }
    }

    /// Store a client message and echo it to everyone as `new-message`.
    fn accept_message(&self, outgoing: OutgoingMessage) {
        let n = self.message_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let message = ApiMessage {
            id: format!("msg-{n}"),
            seq: self.next_seq(),
            local_id: outgoing.local_id.clone(),
            content: MessageContent::encrypted(outgoing.message.clone()),
            created_at: now_ms(),
        };
        self.add_message(&outgoing.sid, message.clone());
        let sid = outgoing.sid.clone();
        self.received.lock().unwrap().push(outgoing);
        self.push_update(UpdateBody::NewMessage { sid, message });
    }

    fn handle_call(&self, event: &str, data: Value) -> Value {
        match event {
            events::RPC_CALL => {
                let ack = match serde_json::from_value::<RpcCall>(data) {
                    Ok(call) => {
                        let handler = self.rpc.lock().unwrap().get(&call.method).cloned();
                        match handler {
                            Some(handler) => handler(&call.params),
                            None => RpcAck {
                                ok: false,
                                result: None,
                                error: Some(format!("{} is not available", call.method)),
                            },
                        }
                    }
                    Err(err) => RpcAck {
                        ok: false,
                        result: None,
                        error: Some(err.to_string()),
                    },
                };
                json!(ack)
            }
            events::UPDATE_METADATA => match serde_json::from_value(data) {
                Ok(request) => json!(self.update_metadata(request)),
                Err(err) => json!(VersionedAck::Error {
                    message: Some(err.to_string())
                }),
            },
            other => json!(VersionedAck::Error {
                message: Some(format!("unsupported call {other}"))
            }),
        }
    }

    fn update_metadata(&self, request: UpdateMetadataRequest) -> VersionedAck {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.iter_mut().find(|s| s.id == request.sid) else {
            return VersionedAck::Error {
                message: Some("session not found".to_string()),
            };
        };
        if session.metadata_version != request.expected_version {
            return VersionedAck::VersionMismatch {
                version: session.metadata_version,
                value: Some(session.metadata.clone()),
            };
        }
        session.metadata_version += 1;
        session.metadata = request.metadata;
        VersionedAck::Success {
            version: session.metadata_version,
            value: Some(session.metadata.clone()),
        }
    }
}

/// Mock sync server on a random local port.
pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn spawn() -> Result<Self> {
        let state = Arc::new(ServerState::default());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Deref for MockServer {
    type Target = ServerState;

    fn deref(&self) -> &ServerState {
        &self.state
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.state.drop_connections();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(UPDATES_PATH, get(updates))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/{id}/messages", get(session_messages))
        .route("/v1/machines", get(list_machines))
        .route("/v1/artifacts", get(list_artifacts).post(create_artifact))
        .route("/v1/artifacts/{id}", get(get_artifact))
        .route("/v1/friends", get(friends))
        .route("/v1/user/search", get(search_users))
        .with_state(state)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        == Some(TEST_TOKEN)
}

type HttpResult<T> = std::result::Result<Json<T>, StatusCode>;

async fn list_sessions(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> HttpResult<SessionsResponse> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.session_lists.fetch_add(1, Ordering::SeqCst);
    let failing = state
        .session_list_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let sessions = state.sessions.lock().unwrap().clone();
    Ok(Json(SessionsResponse { sessions }))
}

async fn session_messages(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HttpResult<MessagesResponse> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.message_fetches.fetch_add(1, Ordering::SeqCst);
    let mut messages = state.stored_messages(&id);
    messages.reverse();
    Ok(Json(MessagesResponse { messages }))
}

async fn list_machines(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> HttpResult<Vec<ApiMachine>> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(state.machines.lock().unwrap().clone()))
}

/// Listings omit bodies, like the real server.
async fn list_artifacts(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> HttpResult<Vec<ApiArtifact>> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let artifacts = state
        .artifacts
        .lock()
        .unwrap()
        .iter()
        .map(|a| ApiArtifact {
            body: None,
            body_version: None,
            ..a.clone()
        })
        .collect();
    Ok(Json(artifacts))
}

async fn get_artifact(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HttpResult<ApiArtifact> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let artifacts = state.artifacts.lock().unwrap();
    artifacts
        .iter()
        .find(|a| a.id == id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn create_artifact(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<CreateArtifactRequest>,
) -> HttpResult<ApiArtifact> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let now = now_ms();
    let artifact = ApiArtifact {
        id: request.id,
        header: request.header,
        header_version: 1,
        body: Some(request.body),
        body_version: Some(1),
        data_encryption_key: request.data_encryption_key,
        seq: state.next_seq(),
        created_at: now,
        updated_at: now,
    };
    state.artifacts.lock().unwrap().push(artifact.clone());
    Ok(Json(artifact))
}

async fn friends(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> HttpResult<FriendsResponse> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let friends = state.friends.lock().unwrap().clone();
    Ok(Json(FriendsResponse { friends }))
}

async fn search_users(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> HttpResult<UserSearchResponse> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let query = params.get("query").cloned().unwrap_or_default().to_lowercase();
    let users = state
        .friends
        .lock()
        .unwrap()
        .iter()
        .filter(|u| u.first_name.to_lowercase().contains(&query))
        .cloned()
        .collect();
    Ok(Json(UserSearchResponse { users }))
}

async fn updates(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| connection(socket, state))
}

async fn connection(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.clients.lock().unwrap().push(tx.clone());

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => state.handle_frame(text.as_str(), &tx),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state
        .clients
        .lock()
        .unwrap()
        .retain(|client| !client.same_channel(&tx));
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
