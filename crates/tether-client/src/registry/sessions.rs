//! Account-wide session list.
//!
//! Holds one [`Session`] per id with decrypted metadata and agent state,
//! patched in place by socket updates and published sorted by `updated_at`
//! (newest first) on a watch channel.

use super::{Versioned, now_ms, versioned_update};
use crate::activity::ActivityUpdate;
use crate::api::SyncApi;
use crate::encryption::{DecryptedMessage, Encryption, SessionEncryption};
use crate::error::{SyncError, SyncResult};
use crate::lock;
use crate::socket::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_protocol::api::{ApiSession, EncryptedField};
use tether_protocol::domain::{AgentState, Metadata};
use tether_protocol::frame::{UpdateMetadataRequest, UpdateStateRequest, events};
use tether_protocol::update::{UpdateBody, UpdateEnvelope, UsageCost, UsageTokens};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    /// Offline; the payload is the last `active_at` in epoch millis.
    LastSeen(u64),
}

/// Latest usage report for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUsage {
    pub key: String,
    pub tokens: UsageTokens,
    pub cost: UsageCost,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub active: bool,
    pub active_at: u64,
    /// `None` when the ciphertext could not be opened.
    pub metadata: Option<Metadata>,
    pub metadata_version: u64,
    pub agent_state: Option<AgentState>,
    pub agent_state_version: u64,
    pub last_message: Option<DecryptedMessage>,
    pub thinking: bool,
    pub thinking_at: u64,
    pub usage: Option<SessionUsage>,
}

impl Session {
    fn from_api(api: &ApiSession, enc: &SessionEncryption) -> Self {
        Self {
            id: api.id.clone(),
            seq: api.seq,
            created_at: api.created_at,
            updated_at: api.updated_at,
            active: api.active,
            active_at: api.active_at,
            metadata: enc.decrypt_metadata(api.metadata_version, &api.metadata),
            metadata_version: api.metadata_version,
            agent_state: enc.decrypt_agent_state(api.agent_state_version, api.agent_state.as_deref()),
            agent_state_version: api.agent_state_version,
            last_message: api.last_message.as_ref().map(|m| enc.decrypt_message(m)),
            thinking: false,
            thinking_at: 0,
            usage: None,
        }
    }

    /// Online while active and seen within `disconnect_timeout`.
    pub fn presence(&self, now_ms: u64, disconnect_timeout: Duration) -> Presence {
        let timeout = disconnect_timeout.as_millis() as u64;
        if self.active && now_ms.saturating_sub(self.active_at) <= timeout {
            Presence::Online
        } else {
            Presence::LastSeen(self.active_at)
        }
    }

    /// Display name: explicit name, else the last path component.
    pub fn title(&self) -> String {
        let Some(metadata) = &self.metadata else {
            return self.id.clone();
        };
        if let Some(name) = &metadata.name {
            return name.clone();
        }
        metadata
            .path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(metadata.path.as_str())
            .to_string()
    }
}

pub struct SessionsRegistry {
    api: Arc<dyn SyncApi>,
    transport: Arc<dyn Transport>,
    encryption: Arc<Encryption>,
    max_version_retries: u32,
    sessions: Mutex<HashMap<String, Session>>,
    /// Listed sessions whose data key this account cannot open.
    unreadable: Mutex<HashSet<String>>,
    tx: watch::Sender<Arc<Vec<Session>>>,
}

impl SessionsRegistry {
    pub fn new(
        api: Arc<dyn SyncApi>,
        transport: Arc<dyn Transport>,
        encryption: Arc<Encryption>,
        max_version_retries: u32,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            api,
            transport,
            encryption,
            max_version_retries,
            sessions: Mutex::new(HashMap::new()),
            unreadable: Mutex::new(HashSet::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Session>>> {
        self.tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        lock(&self.sessions).get(id).cloned()
    }

    /// Current list, newest first.
    pub fn list(&self) -> Arc<Vec<Session>> {
        self.tx.borrow().clone()
    }

    fn publish(&self, sessions: &HashMap<String, Session>) {
        let mut list: Vec<Session> = sessions.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        self.tx.send_replace(Arc::new(list));
    }

    /// Refetch the whole list. Ephemeral fields (thinking, usage) survive.
    pub async fn refresh(&self) -> SyncResult<()> {
        let listed = self.api.list_sessions().await?;
        self.encryption.initialize_sessions(
            listed
                .iter()
                .map(|s| (s.id.clone(), s.data_encryption_key.clone())),
        );

        let mut sessions = lock(&self.sessions);
        let mut fresh = HashMap::with_capacity(listed.len());
        let mut unreadable = HashSet::new();
        for api in &listed {
            let Some(enc) = self.encryption.session(&api.id) else {
                unreadable.insert(api.id.clone());
                continue;
            };
            let mut session = Session::from_api(api, &enc);
            if let Some(previous) = sessions.get(&api.id) {
                session.thinking = previous.thinking;
                session.thinking_at = previous.thinking_at;
                session.usage = previous.usage.clone();
            }
            fresh.insert(api.id.clone(), session);
        }
        *sessions = fresh;
        *lock(&self.unreadable) = unreadable;
        self.publish(&sessions);
        tracing::debug!(count = sessions.len(), "session list refreshed");
        Ok(())
    }

    /// Patch a known session. Returns false when the id is unknown.
    fn patch<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Session, Option<&SessionEncryption>),
    {
        let enc = self.encryption.session(id);
        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        f(session, enc.as_deref());
        self.publish(&sessions);
        true
    }

    /// Fold one durable update. Updates naming an unknown session trigger a
    /// full refetch.
    pub async fn apply_update(&self, update: &UpdateEnvelope) -> SyncResult<()> {
        let known = match &update.body {
            UpdateBody::NewMessage { sid, message } => self.patch(sid, |session, enc| {
                session.seq = session.seq.max(message.seq);
                session.updated_at = session.updated_at.max(update.created_at);
                if let Some(enc) = enc {
                    session.last_message = Some(enc.decrypt_message(message));
                }
            }),
            UpdateBody::NewSession {
                id,
                seq,
                metadata,
                metadata_version,
                agent_state,
                agent_state_version,
                data_encryption_key,
                active,
                active_at,
                created_at,
                updated_at,
            } => match (metadata, created_at, updated_at) {
                (Some(metadata), Some(created_at), Some(updated_at)) => {
                    let api = ApiSession {
                        id: id.clone(),
                        seq: *seq,
                        created_at: *created_at,
                        updated_at: *updated_at,
                        active: *active,
                        active_at: *active_at,
                        metadata: metadata.clone(),
                        metadata_version: *metadata_version,
                        agent_state: agent_state.clone(),
                        agent_state_version: *agent_state_version,
                        data_encryption_key: data_encryption_key.clone(),
                        last_message: None,
                    };
                    self.insert(&api)
                }
                _ => false,
            },
            UpdateBody::DeleteSession { sid } => {
                self.encryption.remove_session(sid);
                lock(&self.unreadable).remove(sid);
                let mut sessions = lock(&self.sessions);
                if sessions.remove(sid).is_some() {
                    self.publish(&sessions);
                }
                true
            }
            UpdateBody::UpdateSession {
                id,
                metadata,
                agent_state,
                active,
                active_at,
            } => self.patch(id, |session, enc| {
                if let Some(enc) = enc {
                    patch_metadata(session, enc, metadata.as_ref());
                    patch_agent_state(session, enc, agent_state.as_ref());
                }
                if let Some(active) = active {
                    session.active = *active;
                }
                if let Some(active_at) = active_at {
                    session.active_at = *active_at;
                }
            }),
            _ => true,
        };

        if known {
            return Ok(());
        }
        if let Some(id) = session_id(&update.body)
            && lock(&self.unreadable).contains(id)
        {
            tracing::debug!(session_id = %id, kind = update.body.kind(), "update for unreadable session");
            return Ok(());
        }
        tracing::debug!(kind = update.body.kind(), "update for unknown session, refetching");
        self.refresh().await
    }

    /// Insert a pushed session. An unopenable data key is remembered rather
    /// than refetched.
    fn insert(&self, api: &ApiSession) -> bool {
        self.encryption
            .initialize_sessions([(api.id.clone(), api.data_encryption_key.clone())]);
        let Some(enc) = self.encryption.session(&api.id) else {
            lock(&self.unreadable).insert(api.id.clone());
            return true;
        };
        let session = Session::from_api(api, &enc);
        let mut sessions = lock(&self.sessions);
        sessions.insert(api.id.clone(), session);
        self.publish(&sessions);
        true
    }

    /// Apply an accumulated activity batch in one publish.
    pub fn apply_activity(&self, batch: &[ActivityUpdate]) {
        let mut sessions = lock(&self.sessions);
        let mut changed = false;
        for update in batch {
            let Some(session) = sessions.get_mut(&update.id) else {
                tracing::debug!(session_id = %update.id, "activity for unknown session");
                continue;
            };
            session.active = update.active;
            session.active_at = update.active_at;
            session.thinking = update.thinking;
            if update.thinking {
                session.thinking_at = update.active_at;
            }
            changed = true;
        }
        if changed {
            self.publish(&sessions);
        }
    }

    pub fn apply_usage(&self, session_id: &str, usage: SessionUsage) {
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get_mut(session_id) {
            session.usage = Some(usage);
            self.publish(&sessions);
        }
    }

    fn versioned_base<T, G>(
        &self,
        session_id: &str,
        field: &str,
        get: G,
    ) -> SyncResult<(Versioned<T>, Arc<SessionEncryption>)>
    where
        G: FnOnce(&Session) -> (Option<T>, u64),
    {
        let not_found = || SyncError::NotFound {
            kind: "session",
            id: session_id.to_string(),
        };
        let enc = self.encryption.session(session_id).ok_or_else(not_found)?;
        let sessions = lock(&self.sessions);
        let session = sessions.get(session_id).ok_or_else(not_found)?;
        let (value, version) = get(session);
        let value = value.ok_or_else(|| SyncError::Decrypt {
            what: format!("{field} of {session_id}"),
        })?;
        Ok((Versioned { value, version }, enc))
    }

    /// Rewrite session metadata with `f`, merging onto the server's value on
    /// version conflicts.
    pub async fn update_metadata<F>(&self, session_id: &str, f: F) -> SyncResult<Metadata>
    where
        F: Fn(Metadata) -> Metadata,
    {
        let (base, enc) = self.versioned_base(session_id, "metadata", |s| {
            (s.metadata.clone(), s.metadata_version)
        })?;
        let updated = versioned_update(
            self.transport.as_ref(),
            events::UPDATE_METADATA,
            "metadata",
            self.max_version_retries,
            base,
            |metadata, version| {
                let request = UpdateMetadataRequest {
                    sid: session_id.to_string(),
                    metadata: enc
                        .encrypt_metadata(metadata)
                        .map_err(|e| SyncError::encrypt("metadata", e))?,
                    expected_version: version,
                };
                serde_json::to_value(&request).map_err(|e| SyncError::protocol(e.to_string()))
            },
            |version, value| enc.decrypt_metadata(version, value?),
            f,
        )
        .await?;

        self.patch(session_id, |session, _| {
            if updated.version > session.metadata_version {
                session.metadata = Some(updated.value.clone());
                session.metadata_version = updated.version;
            }
        });
        Ok(updated.value)
    }

    /// Rewrite the agent state with `f`. A session without state starts from
    /// the empty state.
    pub async fn update_agent_state<F>(&self, session_id: &str, f: F) -> SyncResult<AgentState>
    where
        F: Fn(AgentState) -> AgentState,
    {
        let (base, enc) = self.versioned_base(session_id, "agent state", |s| {
            let state = match (&s.agent_state, s.agent_state_version) {
                (Some(state), _) => Some(state.clone()),
                (None, 0) => Some(AgentState::default()),
                (None, _) => None,
            };
            (state, s.agent_state_version)
        })?;
        let updated = versioned_update(
            self.transport.as_ref(),
            events::UPDATE_STATE,
            "agent state",
            self.max_version_retries,
            base,
            |state, version| {
                let request = UpdateStateRequest {
                    sid: session_id.to_string(),
                    agent_state: Some(
                        enc.encrypt_agent_state(state)
                            .map_err(|e| SyncError::encrypt("agent state", e))?,
                    ),
                    expected_version: version,
                };
                serde_json::to_value(&request).map_err(|e| SyncError::protocol(e.to_string()))
            },
            |version, value| match value {
                Some(value) => enc.decrypt_agent_state(version, Some(value)),
                None => Some(AgentState::default()),
            },
            f,
        )
        .await?;

        self.patch(session_id, |session, _| {
            if updated.version > session.agent_state_version {
                session.agent_state = Some(updated.value.clone());
                session.agent_state_version = updated.version;
            }
        });
        Ok(updated.value)
    }

    /// Sessions currently online, for quick status lines.
    pub fn online_count(&self, disconnect_timeout: Duration) -> usize {
        let now = now_ms();
        lock(&self.sessions)
            .values()
            .filter(|s| s.presence(now, disconnect_timeout) == Presence::Online)
            .count()
    }
}

fn session_id(body: &UpdateBody) -> Option<&str> {
    match body {
        UpdateBody::NewMessage { sid, .. } | UpdateBody::DeleteSession { sid } => Some(sid),
        UpdateBody::NewSession { id, .. } | UpdateBody::UpdateSession { id, .. } => Some(id),
        _ => None,
    }
}

fn patch_metadata(session: &mut Session, enc: &SessionEncryption, field: Option<&EncryptedField>) {
    let Some(field) = field else { return };
    if field.version <= session.metadata_version {
        return;
    }
    session.metadata = enc.decrypt_metadata(field.version, &field.value);
    session.metadata_version = field.version;
}

fn patch_agent_state(session: &mut Session, enc: &SessionEncryption, field: Option<&EncryptedField>) {
    let Some(field) = field else { return };
    if field.version <= session.agent_state_version {
        return;
    }
    session.agent_state = enc.decrypt_agent_state(field.version, Some(&field.value));
    session.agent_state_version = field.version;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::{FakeApi, ScriptedTransport};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tether_crypto::MasterSecret;
    use tether_protocol::api::{ApiMessage, MessageContent};
    use tether_protocol::domain::{PermissionRequest, RawRecord};

    struct Fixture {
        api: Arc<FakeApi>,
        transport: Arc<ScriptedTransport>,
        encryption: Arc<Encryption>,
        registry: SessionsRegistry,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(FakeApi::default());
        let transport = Arc::new(ScriptedTransport::connected());
        let encryption = Arc::new(Encryption::new(&MasterSecret::generate()).unwrap());
        let registry = SessionsRegistry::new(api.clone(), transport.clone(), encryption.clone(), 5);
        Fixture {
            api,
            transport,
            encryption,
            registry,
        }
    }

    fn metadata(path: &str) -> Metadata {
        Metadata {
            path: path.to_string(),
            host: "devbox".to_string(),
            name: None,
            os: None,
            summary: None,
            machine_id: None,
            home_dir: None,
            flavor: None,
        }
    }

    impl Fixture {
        fn enc(&self, id: &str) -> Arc<SessionEncryption> {
            self.encryption.initialize_sessions([(id.to_string(), None)]);
            self.encryption.session(id).unwrap()
        }

        fn api_session(&self, id: &str, updated_at: u64) -> ApiSession {
            let enc = self.enc(id);
            ApiSession {
                id: id.to_string(),
                seq: 1,
                created_at: 1,
                updated_at,
                active: true,
                active_at: updated_at,
                metadata: enc.encrypt_metadata(&metadata(&format!("/src/{id}"))).unwrap(),
                metadata_version: 1,
                agent_state: None,
                agent_state_version: 0,
                data_encryption_key: None,
                last_message: None,
            }
        }

        fn envelope(&self, body: UpdateBody) -> UpdateEnvelope {
            UpdateEnvelope {
                id: "u1".to_string(),
                seq: 100,
                body,
                created_at: 5_000,
            }
        }
    }

    #[tokio::test]
    async fn refresh_decrypts_and_sorts_newest_first() {
        let fx = fixture();
        let older = fx.api_session("s1", 10);
        let newer = fx.api_session("s2", 20);
        fx.api.sessions.lock().unwrap().extend([older, newer]);

        fx.registry.refresh().await.unwrap();
        let list = fx.registry.list();
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s2", "s1"]);
        assert_eq!(list[0].metadata.as_ref().unwrap().path, "/src/s2");
        assert_eq!(list[0].title(), "s2");
    }

    #[tokio::test]
    async fn unknown_session_update_refetches() {
        let fx = fixture();
        let session = fx.api_session("s1", 10);
        fx.api.sessions.lock().unwrap().push(session);

        let update = fx.envelope(UpdateBody::DeleteSession { sid: "s9".to_string() });
        fx.registry.apply_update(&update).await.unwrap();
        assert_eq!(fx.api.session_lists.load(Ordering::SeqCst), 0);

        let message = ApiMessage {
            id: "m1".to_string(),
            seq: 7,
            local_id: None,
            content: MessageContent::Unsupported,
            created_at: 4_000,
        };
        let update = fx.envelope(UpdateBody::NewMessage {
            sid: "s1".to_string(),
            message,
        });
        fx.registry.apply_update(&update).await.unwrap();
        assert_eq!(fx.api.session_lists.load(Ordering::SeqCst), 1);
        assert!(fx.registry.get("s1").is_some());
    }

    fn new_session(id: &str) -> UpdateBody {
        UpdateBody::NewSession {
            id: id.to_string(),
            seq: 0,
            metadata: None,
            metadata_version: 0,
            agent_state: None,
            agent_state_version: 0,
            data_encryption_key: None,
            active: false,
            active_at: 0,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn sparse_new_session_refetches() {
        let fx = fixture();
        let session = fx.api_session("s2", 10);
        fx.api.sessions.lock().unwrap().push(session);

        let update = fx.envelope(new_session("s2"));
        fx.registry.apply_update(&update).await.unwrap();
        assert_eq!(fx.api.session_lists.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.get("s2").unwrap().title(), "s2");
    }

    #[tokio::test]
    async fn complete_new_session_inserts_without_refetch() {
        let fx = fixture();
        let listed = fx.api_session("s3", 10);
        let body = UpdateBody::NewSession {
            id: "s3".to_string(),
            seq: 1,
            metadata: Some(listed.metadata),
            metadata_version: 1,
            agent_state: None,
            agent_state_version: 0,
            data_encryption_key: None,
            active: true,
            active_at: 10,
            created_at: Some(10),
            updated_at: Some(10),
        };
        fx.registry.apply_update(&fx.envelope(body)).await.unwrap();
        assert_eq!(fx.api.session_lists.load(Ordering::SeqCst), 0);
        assert_eq!(fx.registry.get("s3").unwrap().title(), "s3");
    }

    #[tokio::test]
    async fn unreadable_session_pushes_do_not_refetch() {
        let fx = fixture();
        let other_account = Encryption::new(&MasterSecret::generate()).unwrap();
        let foreign_key = other_account
            .encrypt_data_key(&tether_crypto::keys::random_key_material())
            .unwrap();
        fx.api.sessions.lock().unwrap().push(ApiSession {
            id: "s9".to_string(),
            seq: 1,
            created_at: 1,
            updated_at: 10,
            active: true,
            active_at: 10,
            metadata: "AA==".to_string(),
            metadata_version: 1,
            agent_state: None,
            agent_state_version: 0,
            data_encryption_key: Some(foreign_key),
            last_message: None,
        });

        fx.registry.refresh().await.unwrap();
        assert!(fx.registry.get("s9").is_none());
        assert_eq!(fx.api.session_lists.load(Ordering::SeqCst), 1);

        for seq in [2, 3] {
            let message = ApiMessage {
                id: format!("m{seq}"),
                seq,
                local_id: None,
                content: MessageContent::Unsupported,
                created_at: 4_000,
            };
            let update = fx.envelope(UpdateBody::NewMessage {
                sid: "s9".to_string(),
                message,
            });
            fx.registry.apply_update(&update).await.unwrap();
        }
        assert_eq!(fx.api.session_lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_message_patches_last_message_and_seq() {
        let fx = fixture();
        let session = fx.api_session("s1", 10);
        fx.api.sessions.lock().unwrap().push(session);
        fx.registry.refresh().await.unwrap();

        let enc = fx.enc("s1");
        let record = RawRecord::user_text("hello", None);
        let message = ApiMessage {
            id: "m1".to_string(),
            seq: 7,
            local_id: None,
            content: MessageContent::encrypted(enc.encrypt_raw_record(&record).unwrap()),
            created_at: 4_000,
        };
        let update = fx.envelope(UpdateBody::NewMessage {
            sid: "s1".to_string(),
            message,
        });
        fx.registry.apply_update(&update).await.unwrap();

        let session = fx.registry.get("s1").unwrap();
        assert_eq!(session.seq, 7);
        assert_eq!(session.updated_at, 5_000);
        assert_eq!(session.last_message.unwrap().content, Some(record));
    }

    #[tokio::test]
    async fn update_session_ignores_stale_versions() {
        let fx = fixture();
        let session = fx.api_session("s1", 10);
        fx.api.sessions.lock().unwrap().push(session);
        fx.registry.refresh().await.unwrap();
        let enc = fx.enc("s1");

        let stale = EncryptedField {
            value: enc.encrypt_metadata(&metadata("/stale")).unwrap(),
            version: 1,
        };
        let fresh_state = AgentState {
            requests: [(
                "t1".to_string(),
                PermissionRequest {
                    tool: "bash".to_string(),
                    arguments: json!({}),
                    created_at: None,
                },
            )]
            .into(),
            ..AgentState::default()
        };
        let state = EncryptedField {
            value: enc.encrypt_agent_state(&fresh_state).unwrap(),
            version: 3,
        };
        let update = fx.envelope(UpdateBody::UpdateSession {
            id: "s1".to_string(),
            metadata: Some(stale),
            agent_state: Some(state),
            active: Some(false),
            active_at: None,
        });
        fx.registry.apply_update(&update).await.unwrap();

        let session = fx.registry.get("s1").unwrap();
        assert_eq!(session.metadata.unwrap().path, "/src/s1");
        assert_eq!(session.agent_state, Some(fresh_state));
        assert_eq!(session.agent_state_version, 3);
        assert!(!session.active);
    }

    #[tokio::test]
    async fn activity_batch_updates_thinking() {
        let fx = fixture();
        let session = fx.api_session("s1", 10);
        fx.api.sessions.lock().unwrap().push(session);
        fx.registry.refresh().await.unwrap();

        fx.registry.apply_activity(&[
            ActivityUpdate {
                id: "s1".to_string(),
                active: true,
                thinking: true,
                active_at: 900,
            },
            ActivityUpdate {
                id: "ghost".to_string(),
                active: true,
                thinking: false,
                active_at: 900,
            },
        ]);
        let session = fx.registry.get("s1").unwrap();
        assert!(session.thinking);
        assert_eq!(session.thinking_at, 900);

        fx.registry.refresh().await.unwrap();
        assert!(fx.registry.get("s1").unwrap().thinking);
    }

    #[test]
    fn presence_uses_disconnect_timeout() {
        let fx = fixture();
        let enc = fx.enc("s1");
        let mut session = Session::from_api(&fx.api_session("s1", 1_000), &enc);
        let timeout = Duration::from_secs(120);
        assert_eq!(session.presence(1_000 + 120_000, timeout), Presence::Online);
        assert_eq!(session.presence(1_000 + 120_001, timeout), Presence::LastSeen(1_000));
        session.active = false;
        assert_eq!(session.presence(1_000, timeout), Presence::LastSeen(1_000));
    }

    #[tokio::test]
    async fn online_count_skips_stale_sessions() {
        let fx = fixture();
        let now = now_ms();
        let sessions = vec![fx.api_session("s1", now), fx.api_session("s2", 1_000)];
        *fx.api.sessions.lock().unwrap() = sessions;
        fx.registry.refresh().await.unwrap();
        assert_eq!(fx.registry.online_count(Duration::from_secs(120)), 1);
    }

    #[tokio::test]
    async fn update_metadata_retries_on_mismatch() {
        let fx = fixture();
        let session = fx.api_session("s1", 10);
        fx.api.sessions.lock().unwrap().push(session);
        fx.registry.refresh().await.unwrap();
        let enc = fx.enc("s1");

        let mut server = metadata("/src/s1");
        server.name = Some("renamed elsewhere".to_string());
        fx.transport.reply(json!({
            "result": "version-mismatch",
            "version": 4,
            "metadata": enc.encrypt_metadata(&server).unwrap(),
        }));
        fx.transport.reply(json!({"result": "success", "version": 5}));

        let updated = fx
            .registry
            .update_metadata("s1", |mut m| {
                m.os = Some("linux".to_string());
                m
            })
            .await
            .unwrap();
        assert_eq!(updated.name.as_deref(), Some("renamed elsewhere"));
        assert_eq!(updated.os.as_deref(), Some("linux"));

        let calls = fx.transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, events::UPDATE_METADATA);
        assert_eq!(calls[1].1["expectedVersion"], 4);
        drop(calls);

        let session = fx.registry.get("s1").unwrap();
        assert_eq!(session.metadata_version, 5);
        assert_eq!(session.metadata, Some(updated));
    }

    #[tokio::test]
    async fn update_on_unknown_session_is_not_found() {
        let fx = fixture();
        let err = fx
            .registry
            .update_agent_state("nope", |s| s)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { kind: "session", .. }));
    }
}
