//! Per-entity encryption with a shared decrypt cache.
//!
//! [`Encryption`] owns the account keys and hands out one wrapper per
//! session, machine and artifact. Entities created with a data-encryption-key
//! (DEK) use AES-GCM under that key; older entities fall back to the legacy
//! secretbox derived from the master secret.

pub mod cache;

pub use cache::{CacheStats, EncryptionCache};

use anyhow::{Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tether_crypto::cipher::KEY_BYTES;
use tether_crypto::{AesGcmCipher, Cipher, MasterSecret, SealedBoxCipher};
use tether_protocol::api::{ApiMessage, MessageContent};
use tether_protocol::domain::{
    AgentState, ArtifactBody, ArtifactHeader, DaemonState, MachineMetadata, Metadata, RawRecord,
};
use tether_protocol::rpc::RpcTarget;

/// Leading byte of a boxed data-encryption-key.
const DATA_KEY_VERSION: u8 = 0;

/// A message after decryption. `content` is `None` when the ciphertext could
/// not be opened or did not match the record schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedMessage {
    pub id: String,
    pub seq: Option<u64>,
    pub local_id: Option<String>,
    pub content: Option<RawRecord>,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// JSON-over-cipher helper
// ---------------------------------------------------------------------------

/// Base64 + JSON framing over a [`Cipher`].
#[derive(Clone)]
pub struct EntityCipher {
    cipher: Arc<dyn Cipher>,
}

impl EntityCipher {
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self { cipher }
    }

    pub fn encrypt_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let plaintext = serde_json::to_vec(value)?;
        let ciphertext = self.cipher.encrypt_one(&plaintext)?;
        Ok(B64.encode(ciphertext))
    }

    pub fn decrypt_json<T: DeserializeOwned>(&self, encoded: &str) -> Option<T> {
        self.decrypt_json_batch(&[encoded]).pop().flatten()
    }

    /// Decrypt many values in one cipher call. Slots line up with `encoded`.
    pub fn decrypt_json_batch<T: DeserializeOwned>(&self, encoded: &[&str]) -> Vec<Option<T>> {
        let decoded: Vec<Option<Vec<u8>>> = encoded
            .iter()
            .map(|e| match B64.decode(e) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    tracing::debug!(err = %err, "ciphertext is not valid base64");
                    None
                }
            })
            .collect();
        let present: Vec<&[u8]> = decoded.iter().flatten().map(Vec::as_slice).collect();
        let mut opened = self.cipher.decrypt(&present).into_iter();

        decoded
            .iter()
            .map(|slot| {
                slot.as_ref()?;
                let plaintext = opened.next().flatten()?;
                match serde_json::from_slice(&plaintext) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        tracing::debug!(err = %err, "decrypted payload failed schema validation");
                        None
                    }
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Account-level registry
// ---------------------------------------------------------------------------

pub struct Encryption {
    content_keypair: SealedBoxCipher,
    legacy: Arc<dyn Cipher>,
    anonymous_id: String,
    cache: Arc<EncryptionCache>,
    sessions: DashMap<String, Arc<SessionEncryption>>,
    machines: DashMap<String, Arc<MachineEncryption>>,
    artifacts: DashMap<String, Arc<ArtifactEncryption>>,
}

impl Encryption {
    pub fn new(secret: &MasterSecret) -> Result<Self> {
        Ok(Self {
            content_keypair: secret.content_keypair()?,
            legacy: Arc::new(secret.legacy_cipher()?),
            anonymous_id: secret.anonymous_id()?,
            cache: Arc::new(EncryptionCache::new()),
            sessions: DashMap::new(),
            machines: DashMap::new(),
            artifacts: DashMap::new(),
        })
    }

    pub fn anonymous_id(&self) -> &str {
        &self.anonymous_id
    }

    pub fn content_public_key(&self) -> Vec<u8> {
        self.content_keypair.public_key_bytes()
    }

    pub fn cache(&self) -> &Arc<EncryptionCache> {
        &self.cache
    }

    /// Box a fresh data key to our own content keypair: `version ‖ sealed box`.
    pub fn encrypt_data_key(&self, data_key: &[u8; KEY_BYTES]) -> Result<String> {
        let sealed = self.content_keypair.encrypt_one(data_key)?;
        let mut out = Vec::with_capacity(1 + sealed.len());
        out.push(DATA_KEY_VERSION);
        out.extend_from_slice(&sealed);
        Ok(B64.encode(out))
    }

    fn open_data_key(&self, encoded: &str) -> Result<AesGcmCipher> {
        let raw = B64.decode(encoded)?;
        let Some((&version, sealed)) = raw.split_first() else {
            bail!("empty data key");
        };
        if version != DATA_KEY_VERSION {
            bail!("unsupported data key version {version}");
        }
        let Some(key) = self.content_keypair.decrypt_one(sealed) else {
            bail!("data key is not addressed to this account");
        };
        AesGcmCipher::from_slice(&key)
    }

    /// Cipher for an entity: AES-GCM under its DEK when present, otherwise legacy.
    fn entity_cipher(&self, kind: &str, id: &str, data_key: Option<&str>) -> Option<Arc<dyn Cipher>> {
        match data_key {
            None => Some(self.legacy.clone()),
            Some(encoded) => match self.open_data_key(encoded) {
                Ok(cipher) => Some(Arc::new(cipher)),
                Err(err) => {
                    tracing::warn!(kind = kind, id = %id, err = %err, "failed to open data encryption key");
                    None
                }
            },
        }
    }

    /// Bind encryption for each `(session id, data key)` not yet known.
    pub fn initialize_sessions<I>(&self, sessions: I)
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        for (id, data_key) in sessions {
            if self.sessions.contains_key(&id) {
                continue;
            }
            if let Some(cipher) = self.entity_cipher("session", &id, data_key.as_deref()) {
                let enc = SessionEncryption::new(id.clone(), cipher, self.cache.clone());
                self.sessions.insert(id, Arc::new(enc));
            }
        }
    }

    pub fn initialize_machines<I>(&self, machines: I)
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        for (id, data_key) in machines {
            if self.machines.contains_key(&id) {
                continue;
            }
            if let Some(cipher) = self.entity_cipher("machine", &id, data_key.as_deref()) {
                let enc = MachineEncryption::new(id.clone(), cipher, self.cache.clone());
                self.machines.insert(id, Arc::new(enc));
            }
        }
    }

    pub fn initialize_artifact(&self, id: &str, data_key: &str) -> Option<Arc<ArtifactEncryption>> {
        if let Some(existing) = self.artifacts.get(id) {
            return Some(existing.clone());
        }
        let cipher = self.entity_cipher("artifact", id, Some(data_key))?;
        let enc = Arc::new(ArtifactEncryption::new(
            id.to_string(),
            cipher,
            self.cache.clone(),
        ));
        self.artifacts.insert(id.to_string(), enc.clone());
        Some(enc)
    }

    pub fn session(&self, id: &str) -> Option<Arc<SessionEncryption>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    pub fn machine(&self, id: &str) -> Option<Arc<MachineEncryption>> {
        self.machines.get(id).map(|e| e.clone())
    }

    pub fn artifact(&self, id: &str) -> Option<Arc<ArtifactEncryption>> {
        self.artifacts.get(id).map(|e| e.clone())
    }

    pub fn remove_session(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn remove_artifact(&self, id: &str) {
        self.artifacts.remove(id);
    }

    /// The cipher that encrypts RPC traffic addressed to `target_id`.
    pub fn rpc_cipher(&self, target: RpcTarget, target_id: &str) -> Option<EntityCipher> {
        match target {
            RpcTarget::Session => self.session(target_id).map(|e| e.raw().clone()),
            RpcTarget::Machine => self.machine(target_id).map(|e| e.raw().clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub struct SessionEncryption {
    session_id: String,
    cipher: EntityCipher,
    cache: Arc<EncryptionCache>,
}

impl SessionEncryption {
    pub fn new(session_id: String, cipher: Arc<dyn Cipher>, cache: Arc<EncryptionCache>) -> Self {
        Self {
            session_id,
            cipher: EntityCipher::new(cipher),
            cache,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn raw(&self) -> &EntityCipher {
        &self.cipher
    }

    pub fn decrypt_metadata(&self, version: u64, encrypted: &str) -> Option<Metadata> {
        let key = (self.session_id.clone(), version);
        if let Some(hit) = self.cache.metadata.get(&key) {
            return hit;
        }
        let value = self.cipher.decrypt_json(encrypted);
        self.cache.metadata.put(key, value.clone());
        value
    }

    /// `None` ciphertext means the session has no agent state yet.
    pub fn decrypt_agent_state(&self, version: u64, encrypted: Option<&str>) -> Option<AgentState> {
        let encrypted = encrypted?;
        let key = (self.session_id.clone(), version);
        if let Some(hit) = self.cache.agent_states.get(&key) {
            return hit;
        }
        let value = self.cipher.decrypt_json(encrypted);
        self.cache.agent_states.put(key, value.clone());
        value
    }

    pub fn decrypt_message(&self, message: &ApiMessage) -> DecryptedMessage {
        self.decrypt_messages(std::slice::from_ref(message))
            .pop()
            .unwrap_or_else(|| undecryptable(message))
    }

    /// Batch decrypt; cache hits skip the cipher entirely.
    pub fn decrypt_messages(&self, messages: &[ApiMessage]) -> Vec<DecryptedMessage> {
        let mut contents: Vec<Option<Option<RawRecord>>> = messages
            .iter()
            .map(|m| self.cache.messages.get(&m.id))
            .collect();

        let misses: Vec<(usize, &str)> = messages
            .iter()
            .enumerate()
            .filter(|(i, _)| contents[*i].is_none())
            .filter_map(|(i, m)| match &m.content {
                MessageContent::Encrypted { c } => Some((i, c.as_str())),
                MessageContent::Unsupported => None,
            })
            .collect();

        if !misses.is_empty() {
            let ciphertexts: Vec<&str> = misses.iter().map(|(_, c)| *c).collect();
            let opened: Vec<Option<RawRecord>> = self.cipher.decrypt_json_batch(&ciphertexts);
            for ((i, _), record) in misses.into_iter().zip(opened) {
                self.cache.messages.put(messages[i].id.clone(), record.clone());
                contents[i] = Some(record);
            }
        }

        messages
            .iter()
            .zip(contents)
            .map(|(m, content)| DecryptedMessage {
                id: m.id.clone(),
                seq: Some(m.seq),
                local_id: m.local_id.clone(),
                content: content.flatten(),
                created_at: m.created_at,
            })
            .collect()
    }

    pub fn encrypt_metadata(&self, metadata: &Metadata) -> Result<String> {
        self.cipher.encrypt_json(metadata)
    }

    pub fn encrypt_agent_state(&self, state: &AgentState) -> Result<String> {
        self.cipher.encrypt_json(state)
    }

    pub fn encrypt_raw_record(&self, record: &RawRecord) -> Result<String> {
        self.cipher.encrypt_json(record)
    }

    pub fn encrypt_raw<T: Serialize>(&self, value: &T) -> Result<String> {
        self.cipher.encrypt_json(value)
    }

    pub fn decrypt_raw<T: DeserializeOwned>(&self, encrypted: &str) -> Option<T> {
        self.cipher.decrypt_json(encrypted)
    }
}

fn undecryptable(message: &ApiMessage) -> DecryptedMessage {
    DecryptedMessage {
        id: message.id.clone(),
        seq: Some(message.seq),
        local_id: message.local_id.clone(),
        content: None,
        created_at: message.created_at,
    }
}

// ---------------------------------------------------------------------------
// Machines
// ---------------------------------------------------------------------------

pub struct MachineEncryption {
    machine_id: String,
    cipher: EntityCipher,
    cache: Arc<EncryptionCache>,
}

impl MachineEncryption {
    pub fn new(machine_id: String, cipher: Arc<dyn Cipher>, cache: Arc<EncryptionCache>) -> Self {
        Self {
            machine_id,
            cipher: EntityCipher::new(cipher),
            cache,
        }
    }

    pub fn raw(&self) -> &EntityCipher {
        &self.cipher
    }

    pub fn decrypt_metadata(&self, version: u64, encrypted: &str) -> Option<MachineMetadata> {
        let key = (self.machine_id.clone(), version);
        if let Some(hit) = self.cache.machine_metadata.get(&key) {
            return hit;
        }
        let value = self.cipher.decrypt_json(encrypted);
        self.cache.machine_metadata.put(key, value.clone());
        value
    }

    pub fn decrypt_daemon_state(&self, version: u64, encrypted: Option<&str>) -> Option<DaemonState> {
        let encrypted = encrypted?;
        let key = (self.machine_id.clone(), version);
        if let Some(hit) = self.cache.daemon_states.get(&key) {
            return hit;
        }
        let value = self.cipher.decrypt_json(encrypted);
        self.cache.daemon_states.put(key, value.clone());
        value
    }

    pub fn encrypt_metadata(&self, metadata: &MachineMetadata) -> Result<String> {
        self.cipher.encrypt_json(metadata)
    }

    pub fn encrypt_daemon_state(&self, state: &DaemonState) -> Result<String> {
        self.cipher.encrypt_json(state)
    }

    pub fn encrypt_raw<T: Serialize>(&self, value: &T) -> Result<String> {
        self.cipher.encrypt_json(value)
    }

    pub fn decrypt_raw<T: DeserializeOwned>(&self, encrypted: &str) -> Option<T> {
        self.cipher.decrypt_json(encrypted)
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

pub struct ArtifactEncryption {
    artifact_id: String,
    cipher: EntityCipher,
    cache: Arc<EncryptionCache>,
}

impl ArtifactEncryption {
    pub fn new(artifact_id: String, cipher: Arc<dyn Cipher>, cache: Arc<EncryptionCache>) -> Self {
        Self {
            artifact_id,
            cipher: EntityCipher::new(cipher),
            cache,
        }
    }

    pub fn decrypt_header(&self, version: u64, encrypted: &str) -> Option<ArtifactHeader> {
        let key = (self.artifact_id.clone(), version);
        if let Some(hit) = self.cache.artifact_headers.get(&key) {
            return hit;
        }
        let value = self.cipher.decrypt_json(encrypted);
        self.cache.artifact_headers.put(key, value.clone());
        value
    }

    pub fn decrypt_body(&self, version: u64, encrypted: &str) -> Option<ArtifactBody> {
        let key = (self.artifact_id.clone(), version);
        if let Some(hit) = self.cache.artifact_bodies.get(&key) {
            return hit;
        }
        let value = self.cipher.decrypt_json(encrypted);
        self.cache.artifact_bodies.put(key, value.clone());
        value
    }

    pub fn encrypt_header(&self, header: &ArtifactHeader) -> Result<String> {
        self.cipher.encrypt_json(header)
    }

    pub fn encrypt_body(&self, body: &ArtifactBody) -> Result<String> {
        self.cipher.encrypt_json(body)
    }
}
