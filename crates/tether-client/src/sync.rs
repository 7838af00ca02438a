//! The sync engine: owns the socket and registries and pumps pushes into them.

use crate::activity::{AccumulatorConfig, ActivityAccumulator, ActivityUpdate};
use crate::api::SyncApi;
use crate::config::ClientConfig;
use crate::encryption::Encryption;
use crate::error::{SyncError, SyncResult};
use crate::file_index::{FileMatch, FileSearchIndex, RipgrepLister};
use crate::lock;
use crate::registry::{
    ArtifactRegistry, MachineRegistry, SessionSync, SessionUsage, SessionsRegistry,
};
use crate::socket::{ConnectionState, SyncSocket, Transport};
use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_crypto::MasterSecret;
use tether_protocol::api::{RelationshipStatus, UserProfile};
use tether_protocol::update::{EphemeralUpdate, UpdateBody, UpdateEnvelope};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Account-level notifications that have no registry of their own.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    AccountUpdated {
        first_name: Option<String>,
        last_name: Option<String>,
        settings_version: Option<u64>,
    },
    RelationshipUpdated {
        from_user_id: String,
        to_user_id: String,
        status: RelationshipStatus,
        timestamp: u64,
    },
    /// Socket came back and every registry was refetched.
    Resynced,
}

struct Inner {
    config: ClientConfig,
    encryption: Arc<Encryption>,
    socket: Arc<SyncSocket>,
    api: Arc<dyn SyncApi>,
    sessions: SessionsRegistry,
    machines: MachineRegistry,
    artifacts: ArtifactRegistry,
    timelines: DashMap<String, Arc<SessionSync>>,
    accumulator: ActivityAccumulator,
    file_index: FileSearchIndex,
    events_tx: broadcast::Sender<SyncEvent>,
    cancel: CancellationToken,
}

pub struct SyncEngine {
    inner: Arc<Inner>,
    activity_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<ActivityUpdate>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set once the initial fetch has succeeded.
    initialized: AtomicBool,
}

impl SyncEngine {
    /// Build the engine with the HTTP API served by the same endpoint.
    pub fn new(config: ClientConfig, secret: &MasterSecret) -> Result<Self> {
        let encryption = Arc::new(Encryption::new(secret)?);
        let socket = Arc::new(SyncSocket::new(&config, encryption.clone())?);
        let api: Arc<dyn SyncApi> = Arc::new(socket.http().clone());
        Ok(Self::assemble(config, encryption, socket, api))
    }

    /// Build the engine over a caller-supplied HTTP side.
    pub fn with_api(
        config: ClientConfig,
        secret: &MasterSecret,
        api: Arc<dyn SyncApi>,
    ) -> Result<Self> {
        let encryption = Arc::new(Encryption::new(secret)?);
        let socket = Arc::new(SyncSocket::new(&config, encryption.clone())?);
        Ok(Self::assemble(config, encryption, socket, api))
    }

    fn assemble(
        config: ClientConfig,
        encryption: Arc<Encryption>,
        socket: Arc<SyncSocket>,
        api: Arc<dyn SyncApi>,
    ) -> Self {
        let transport: Arc<dyn Transport> = socket.clone();
        let retries = config.max_version_retries;
        let (accumulator, activity_rx) = ActivityAccumulator::new(AccumulatorConfig::new(
            config.activity_debounce(),
            config.disconnect_timeout(),
        ));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let lister = Arc::new(RipgrepLister::new(transport.clone(), encryption.clone()));

        let inner = Inner {
            sessions: SessionsRegistry::new(
                api.clone(),
                transport.clone(),
                encryption.clone(),
                retries,
            ),
            machines: MachineRegistry::new(
                api.clone(),
                transport.clone(),
                encryption.clone(),
                retries,
            ),
            artifacts: ArtifactRegistry::new(api.clone(), encryption.clone()),
            timelines: DashMap::new(),
            accumulator,
            file_index: FileSearchIndex::new(lister, config.file_index_ttl()),
            events_tx,
            cancel: CancellationToken::new(),
            config,
            encryption,
            socket,
            api,
        };
        Self {
            inner: Arc::new(inner),
            activity_rx: Mutex::new(Some(activity_rx)),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Start the pumps, connect, and fetch the initial state. Once it has
    /// succeeded further calls are no-ops; after a failed fetch, calling it
    /// again retries the fetch.
    pub async fn initialize(&self) -> SyncResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let inner = &self.inner;
        let activity_rx = lock(&self.activity_rx).take();
        if let Some(activity_rx) = activity_rx {
            let mut tasks = lock(&self.tasks);
            tasks.push(tokio::spawn(update_pump(inner.clone(), inner.socket.updates())));
            tasks.push(tokio::spawn(ephemeral_pump(
                inner.clone(),
                inner.socket.ephemerals(),
            )));
            tasks.push(tokio::spawn(activity_pump(inner.clone(), activity_rx)));
            tasks.push(tokio::spawn(reconnect_watch(inner.clone(), inner.socket.state())));
        }
        inner.socket.connect();

        inner.sessions.refresh().await?;
        self.initialized.store(true, Ordering::SeqCst);
        if let Err(err) = inner.machines.refresh().await {
            tracing::warn!(err = %err, "initial machine fetch failed");
        }
        if let Err(err) = inner.artifacts.refresh().await {
            tracing::warn!(err = %err, "initial artifact fetch failed");
        }
        tracing::info!(
            endpoint = %inner.config.endpoint,
            sessions = inner.sessions.list().len(),
            "sync engine initialized"
        );
        Ok(())
    }

    /// Stop every task, close the socket and drop cached plaintext.
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.inner.accumulator.cancel();
        self.inner.socket.dispose();
        self.inner.encryption.cache().clear();
    }

    pub fn sessions(&self) -> &SessionsRegistry {
        &self.inner.sessions
    }

    pub fn machines(&self) -> &MachineRegistry {
        &self.inner.machines
    }

    pub fn artifacts(&self) -> &ArtifactRegistry {
        &self.inner.artifacts
    }

    pub fn socket(&self) -> &Arc<SyncSocket> {
        &self.inner.socket
    }

    pub fn encryption(&self) -> &Arc<Encryption> {
        &self.inner.encryption
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.socket.state()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events_tx.subscribe()
    }

    /// The timeline for `session_id`, created on first use. Call
    /// [`SessionSync::load`] before reading it.
    pub fn session(&self, session_id: &str) -> SyncResult<Arc<SessionSync>> {
        self.inner.session(session_id)
    }

    pub async fn search_files(
        &self,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> SyncResult<Vec<FileMatch>> {
        self.inner.file_index.search(session_id, query, limit).await
    }

    pub fn invalidate_files(&self, session_id: &str) {
        self.inner.file_index.invalidate(session_id);
    }

    pub async fn friends(&self) -> SyncResult<Vec<UserProfile>> {
        self.inner.api.friends().await
    }

    pub async fn search_users(&self, query: &str) -> SyncResult<Vec<UserProfile>> {
        self.inner.api.search_users(query).await
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    fn session(&self, session_id: &str) -> SyncResult<Arc<SessionSync>> {
        if let Some(existing) = self.timelines.get(session_id) {
            return Ok(existing.value().clone());
        }
        if self.encryption.session(session_id).is_none() {
            return Err(SyncError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            });
        }
        let transport: Arc<dyn Transport> = self.socket.clone();
        let timeline = self
            .timelines
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionSync::new(
                    session_id,
                    self.api.clone(),
                    transport,
                    self.encryption.clone(),
                    self.config.message_load_retry(),
                ))
            })
            .value()
            .clone();
        Ok(timeline)
    }

    async fn route_update(&self, update: UpdateEnvelope) {
        tracing::trace!(kind = update.body.kind(), seq = update.seq, "update");
        match &update.body {
            UpdateBody::NewMessage { sid, message } => {
                self.apply_to_sessions(&update).await;
                let timeline = self.timelines.get(sid).map(|t| t.value().clone());
                if let Some(timeline) = timeline {
                    timeline.apply_message(message.clone()).await;
                }
                self.file_index.invalidate(sid);
            }
            UpdateBody::UpdateSession { id, agent_state, .. } => {
                self.apply_to_sessions(&update).await;
                let timeline = self.timelines.get(id).map(|t| t.value().clone());
                if agent_state.is_some()
                    && let Some(timeline) = timeline
                    && let Some(state) = self.sessions.get(id).and_then(|s| s.agent_state)
                {
                    timeline.apply_agent_state(&state).await;
                }
            }
            UpdateBody::DeleteSession { sid } => {
                self.timelines.remove(sid);
                self.file_index.remove(sid);
                self.apply_to_sessions(&update).await;
            }
            UpdateBody::NewSession { .. } => self.apply_to_sessions(&update).await,
            UpdateBody::UpdateMachine { .. } => {
                if let Err(err) = self.machines.apply_update(&update).await {
                    tracing::warn!(err = %err, "failed to apply machine update");
                }
            }
            UpdateBody::NewArtifact { .. }
            | UpdateBody::UpdateArtifact { .. }
            | UpdateBody::DeleteArtifact { .. } => self.artifacts.apply_update(&update),
            UpdateBody::UpdateAccount {
                settings,
                first_name,
                last_name,
                ..
            } => self.emit(SyncEvent::AccountUpdated {
                first_name: first_name.clone(),
                last_name: last_name.clone(),
                settings_version: settings.as_ref().map(|s| s.version),
            }),
            UpdateBody::RelationshipUpdated {
                from_user_id,
                to_user_id,
                status,
                timestamp,
            } => self.emit(SyncEvent::RelationshipUpdated {
                from_user_id: from_user_id.clone(),
                to_user_id: to_user_id.clone(),
                status: *status,
                timestamp: *timestamp,
            }),
        }
    }

    async fn apply_to_sessions(&self, update: &UpdateEnvelope) {
        if let Err(err) = self.sessions.apply_update(update).await {
            tracing::warn!(kind = update.body.kind(), err = %err, "failed to apply session update");
        }
    }

    fn route_ephemeral(&self, update: EphemeralUpdate) {
        match update {
            EphemeralUpdate::Activity {
                id,
                active,
                active_at,
                thinking,
            } => self.accumulator.add_update(ActivityUpdate {
                id,
                active,
                thinking,
                active_at,
            }),
            EphemeralUpdate::Usage {
                id,
                key,
                tokens,
                cost,
                timestamp,
            } => self.sessions.apply_usage(
                &id,
                SessionUsage {
                    key,
                    tokens,
                    cost,
                    timestamp,
                },
            ),
            EphemeralUpdate::MachineActivity {
                id,
                active,
                active_at,
            } => self.machines.apply_activity(&id, active, active_at),
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Refetch everything after a reconnect; pushes sent while offline are lost.
    async fn resync(&self) {
        tracing::info!("socket reconnected, resyncing");
        self.accumulator.reset();
        if let Err(err) = self.sessions.refresh().await {
            tracing::warn!(err = %err, "session resync failed");
        }
        if let Err(err) = self.machines.refresh().await {
            tracing::warn!(err = %err, "machine resync failed");
        }
        if let Err(err) = self.artifacts.refresh().await {
            tracing::warn!(err = %err, "artifact resync failed");
        }
        // Timelines that were never loaded fetch fresh history on first load.
        let timelines: Vec<Arc<SessionSync>> = self
            .timelines
            .iter()
            .map(|t| t.value().clone())
            .filter(|t| t.view().loaded)
            .collect();
        for timeline in timelines {
            if let Err(err) = timeline.reload().await {
                tracing::warn!(session_id = %timeline.session_id(), err = %err, "timeline resync failed");
            }
        }
        self.emit(SyncEvent::Resynced);
    }
}

async fn update_pump(inner: Arc<Inner>, mut updates: broadcast::Receiver<UpdateEnvelope>) {
    loop {
        let received = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            received = updates.recv() => received,
        };
        match received {
            Ok(update) => inner.route_update(update).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "update pump lagged, resyncing");
                inner.resync().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn ephemeral_pump(inner: Arc<Inner>, mut ephemerals: broadcast::Receiver<EphemeralUpdate>) {
    loop {
        let received = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            received = ephemerals.recv() => received,
        };
        match received {
            Ok(update) => inner.route_ephemeral(update),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "ephemeral pump lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn activity_pump(
    inner: Arc<Inner>,
    mut batches: mpsc::UnboundedReceiver<Vec<ActivityUpdate>>,
) {
    loop {
        let batch = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            batch = batches.recv() => batch,
        };
        let Some(batch) = batch else { break };
        inner.sessions.apply_activity(&batch);
    }
}

/// Resync on every transition into `Connected` except the first.
async fn reconnect_watch(inner: Arc<Inner>, mut state: watch::Receiver<ConnectionState>) {
    let mut connected_before = false;
    loop {
        let current = *state.borrow_and_update();
        if current == ConnectionState::Connected {
            if connected_before {
                inner.resync().await;
            }
            connected_before = true;
        }
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
