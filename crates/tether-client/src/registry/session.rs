//! One session's message timeline.
//!
//! [`SessionSync`] loads the history once, folds it through the reducer and
//! then applies live messages in arrival order. Live messages that show up
//! while the history is still loading are buffered and applied afterwards,
//! so a message is never folded ahead of its predecessors.

use super::now_ms;
use crate::api::SyncApi;
use crate::encryption::{Encryption, SessionEncryption};
use crate::error::{SyncError, SyncResult};
use crate::reducer::{Message, Reducer, ReducerState};
use crate::socket::{self, Transport};
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::api::ApiMessage;
use tether_protocol::domain::{AgentState, RawRecord, TodoItem};
use tether_protocol::frame::{OutgoingMessage, events};
use tether_protocol::rpc::{
    Abort, AbortParams, Bash, BashParams, BashResult, Empty, GetDirectoryTree, KillSession,
    ListDirectory, ListDirectoryResult, PathParams, Permission, PermissionParams, ReadFile,
    ReadFileResult, Ripgrep, RipgrepParams, RipgrepResult, RpcMethod, SimpleResult, Switch, SwitchParams,
    TreeParams, TreeResult, WriteFile, WriteFileParams, WriteFileResult,
};
use tokio::sync::{Mutex, watch};

const ABORT_REASON: &str =
    "The user doesn't want to proceed with this tool use. The tool use was rejected.";

/// Snapshot published to subscribers after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub messages: Vec<Message>,
    pub todos: Vec<TodoItem>,
    pub old_todos: Option<Vec<TodoItem>>,
    pub loaded: bool,
}

#[derive(Default)]
struct Timeline {
    reducer: ReducerState,
    loaded: bool,
    buffered: Vec<ApiMessage>,
    agent_state: Option<AgentState>,
}

pub struct SessionSync {
    session_id: String,
    api: Arc<dyn SyncApi>,
    transport: Arc<dyn Transport>,
    encryption: Arc<Encryption>,
    retry_delay: Duration,
    timeline: Mutex<Timeline>,
    /// Serializes `load`/`reload`; live messages only take `timeline`.
    loading: Mutex<()>,
    tx: watch::Sender<Arc<SessionView>>,
}

impl SessionSync {
    pub fn new(
        session_id: impl Into<String>,
        api: Arc<dyn SyncApi>,
        transport: Arc<dyn Transport>,
        encryption: Arc<Encryption>,
        retry_delay: Duration,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(SessionView::default()));
        Self {
            session_id: session_id.into(),
            api,
            transport,
            encryption,
            retry_delay,
            timeline: Mutex::new(Timeline::default()),
            loading: Mutex::new(()),
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionView>> {
        self.tx.subscribe()
    }

    pub fn view(&self) -> Arc<SessionView> {
        self.tx.borrow().clone()
    }

    fn session_encryption(&self) -> SyncResult<Arc<SessionEncryption>> {
        self.encryption
            .session(&self.session_id)
            .ok_or_else(|| SyncError::NotFound {
                kind: "session",
                id: self.session_id.clone(),
            })
    }

    fn publish(&self, timeline: &Timeline) {
        self.tx.send_replace(Arc::new(SessionView {
            messages: timeline.reducer.messages().to_vec(),
            todos: timeline.reducer.todos().to_vec(),
            old_todos: timeline.reducer.old_todos().map(<[TodoItem]>::to_vec),
            loaded: timeline.loaded,
        }));
    }

    /// Load the full history unless already loaded. Fetch failures are
    /// retried forever with a fixed delay.
    pub async fn load(&self) -> SyncResult<()> {
        let _loading = self.loading.lock().await;
        if self.timeline.lock().await.loaded {
            return Ok(());
        }
        self.load_locked().await
    }

    /// Drop the folded state and load again from scratch.
    pub async fn reload(&self) -> SyncResult<()> {
        let _loading = self.loading.lock().await;
        {
            let mut timeline = self.timeline.lock().await;
            let buffered = std::mem::take(&mut timeline.buffered);
            let agent_state = timeline.agent_state.take();
            *timeline = Timeline {
                buffered,
                agent_state,
                ..Timeline::default()
            };
            self.publish(&timeline);
        }
        self.load_locked().await
    }

    async fn load_locked(&self) -> SyncResult<()> {
        let enc = self.session_encryption()?;
        let mut history = loop {
            match self.api.session_messages(&self.session_id).await {
                Ok(messages) => break messages,
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, err = %err, "failed to load messages, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        };
        history.reverse();
        let decrypted = enc.decrypt_messages(&history);

        let mut timeline = self.timeline.lock().await;
        Reducer::apply_all(&mut timeline.reducer, &decrypted);
        let buffered = std::mem::take(&mut timeline.buffered);
        let live = enc.decrypt_messages(&buffered);
        Reducer::apply_all(&mut timeline.reducer, &live);
        if let Some(agent_state) = timeline.agent_state.clone() {
            Reducer::apply_agent_state(&mut timeline.reducer, &agent_state);
        }
        timeline.loaded = true;
        self.publish(&timeline);
        tracing::debug!(
            session_id = %self.session_id,
            history = history.len(),
            buffered = buffered.len(),
            "session loaded"
        );
        Ok(())
    }

    /// Apply one live message, or buffer it until the history is loaded.
    pub async fn apply_message(&self, message: ApiMessage) {
        let mut timeline = self.timeline.lock().await;
        if !timeline.loaded {
            timeline.buffered.push(message);
            return;
        }
        let Ok(enc) = self.session_encryption() else {
            tracing::warn!(session_id = %self.session_id, "no encryption for live message");
            return;
        };
        let decrypted = enc.decrypt_message(&message);
        if !Reducer::apply(&mut timeline.reducer, &decrypted).is_empty() {
            self.publish(&timeline);
        }
    }

    /// Fold permission state into the tool calls.
    pub async fn apply_agent_state(&self, agent_state: &AgentState) {
        let mut timeline = self.timeline.lock().await;
        timeline.agent_state = Some(agent_state.clone());
        if !Reducer::apply_agent_state(&mut timeline.reducer, agent_state).is_empty() {
            self.publish(&timeline);
        }
    }

    /// Send a user message. It appears immediately under a fresh local id,
    /// which is returned; the server echo later fills in its id and seq.
    pub async fn send_message(&self, text: &str) -> SyncResult<String> {
        let enc = self.session_encryption()?;
        let local_id = uuid::Uuid::new_v4().to_string();
        let record = RawRecord::user_text(text, Some(local_id.clone()));
        let outgoing = OutgoingMessage {
            sid: self.session_id.clone(),
            message: enc
                .encrypt_raw_record(&record)
                .map_err(|e| SyncError::encrypt("message", e))?,
            local_id: Some(local_id.clone()),
        };
        let payload =
            serde_json::to_value(&outgoing).map_err(|e| SyncError::protocol(e.to_string()))?;

        // Held across the emit so the echo cannot be folded before the
        // optimistic copy exists.
        let mut timeline = self.timeline.lock().await;
        if !self.transport.send(events::MESSAGE, payload) {
            return Err(SyncError::NotConnected);
        }
        timeline.reducer.push_optimistic(&local_id, text, now_ms());
        self.publish(&timeline);
        Ok(local_id)
    }

    // -----------------------------------------------------------------------
    // Session RPC
    // -----------------------------------------------------------------------

    pub async fn abort(&self) -> SyncResult<()> {
        let params = AbortParams {
            reason: ABORT_REASON.to_string(),
        };
        self.rpc::<Abort>(&params).await.map(drop)
    }

    pub async fn permission(&self, params: PermissionParams) -> SyncResult<()> {
        self.rpc::<Permission>(&params).await.map(drop)
    }

    /// Hand control to `local` or `remote`.
    pub async fn switch_mode(&self, to: &str) -> SyncResult<()> {
        let params = SwitchParams { to: to.to_string() };
        self.rpc::<Switch>(&params).await.map(drop)
    }

    pub async fn bash(
        &self,
        command: &str,
        cwd: &str,
        timeout_ms: Option<u64>,
    ) -> SyncResult<BashResult> {
        let params = BashParams {
            command: command.to_string(),
            cwd: cwd.to_string(),
            timeout: timeout_ms,
        };
        self.rpc::<Bash>(&params).await
    }

    pub async fn read_file(&self, path: &str) -> SyncResult<ReadFileResult> {
        self.rpc::<ReadFile>(&PathParams {
            path: path.to_string(),
        })
        .await
    }

    /// `expected_hash` guards against overwriting a file changed elsewhere.
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        expected_hash: Option<String>,
    ) -> SyncResult<WriteFileResult> {
        let params = WriteFileParams {
            path: path.to_string(),
            content: content.to_string(),
            expected_hash,
        };
        self.rpc::<WriteFile>(&params).await
    }

    pub async fn list_directory(&self, path: &str) -> SyncResult<ListDirectoryResult> {
        self.rpc::<ListDirectory>(&PathParams {
            path: path.to_string(),
        })
        .await
    }

    pub async fn get_directory_tree(&self, path: &str, max_depth: u32) -> SyncResult<TreeResult> {
        let params = TreeParams {
            path: path.to_string(),
            max_depth,
        };
        self.rpc::<GetDirectoryTree>(&params).await
    }

    pub async fn ripgrep(
        &self,
        args: Vec<String>,
        cwd: Option<String>,
    ) -> SyncResult<RipgrepResult> {
        self.rpc::<Ripgrep>(&RipgrepParams { args, cwd }).await
    }

    pub async fn kill_session(&self) -> SyncResult<SimpleResult> {
        self.rpc::<KillSession>(&Empty {}).await
    }

    async fn rpc<M: RpcMethod>(&self, params: &M::Params) -> SyncResult<M::Result> {
        socket::rpc::<M>(
            self.transport.as_ref(),
            &self.encryption,
            &self.session_id,
            params,
        )
        .await
    }
}
