//! Encrypted artifacts: small titled documents, each under its own data key.

use crate::api::SyncApi;
use crate::encryption::{ArtifactEncryption, Encryption};
use crate::error::{SyncError, SyncResult};
use crate::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tether_crypto::keys::random_key_material;
use tether_protocol::api::{ApiArtifact, CreateArtifactRequest};
use tether_protocol::domain::{ArtifactBody, ArtifactHeader};
use tether_protocol::update::{UpdateBody, UpdateEnvelope};
use tokio::sync::watch;
use zeroize::Zeroize;

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub header: Option<ArtifactHeader>,
    pub header_version: u64,
    /// Only present once fetched; list responses omit bodies.
    pub body: Option<ArtifactBody>,
    pub body_version: Option<u64>,
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Artifact {
    fn from_api(api: &ApiArtifact, enc: &ArtifactEncryption) -> Self {
        let body = match (&api.body, api.body_version) {
            (Some(body), Some(version)) => enc.decrypt_body(version, body),
            _ => None,
        };
        Self {
            id: api.id.clone(),
            header: enc.decrypt_header(api.header_version, &api.header),
            header_version: api.header_version,
            body,
            body_version: api.body_version,
            seq: api.seq,
            created_at: api.created_at,
            updated_at: api.updated_at,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.header.as_ref()?.title.as_deref()
    }
}

pub struct ArtifactRegistry {
    api: Arc<dyn SyncApi>,
    encryption: Arc<Encryption>,
    artifacts: Mutex<HashMap<String, Artifact>>,
    tx: watch::Sender<Arc<Vec<Artifact>>>,
}

impl ArtifactRegistry {
    pub fn new(api: Arc<dyn SyncApi>, encryption: Arc<Encryption>) -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            api,
            encryption,
            artifacts: Mutex::new(HashMap::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Artifact>>> {
        self.tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Artifact> {
        lock(&self.artifacts).get(id).cloned()
    }

    fn publish(&self, artifacts: &HashMap<String, Artifact>) {
        let mut list: Vec<Artifact> = artifacts.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        self.tx.send_replace(Arc::new(list));
    }

    /// Decrypt and store one artifact. Skipped when its data key cannot be
    /// opened with this account's content key.
    fn store(&self, api: &ApiArtifact) -> Option<Artifact> {
        let enc = self
            .encryption
            .initialize_artifact(&api.id, &api.data_encryption_key)?;
        let mut artifact = Artifact::from_api(api, &enc);
        let mut artifacts = lock(&self.artifacts);
        if artifact.body.is_none()
            && let Some(existing) = artifacts.get(&api.id)
        {
            artifact.body = existing.body.clone();
            artifact.body_version = existing.body_version;
        }
        artifacts.insert(api.id.clone(), artifact.clone());
        self.publish(&artifacts);
        Some(artifact)
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        let listed = self.api.list_artifacts().await?;
        let ids: Vec<&str> = listed.iter().map(|a| a.id.as_str()).collect();
        lock(&self.artifacts).retain(|id, _| ids.contains(&id.as_str()));
        for api in &listed {
            self.store(api);
        }
        tracing::debug!(count = listed.len(), "artifact list refreshed");
        Ok(())
    }

    /// Fetch one artifact including its body.
    pub async fn fetch_body(&self, artifact_id: &str) -> SyncResult<Artifact> {
        let api = self.api.get_artifact(artifact_id).await?;
        self.store(&api).ok_or_else(|| SyncError::Decrypt {
            what: format!("artifact {artifact_id}"),
        })
    }

    /// Create an artifact under a fresh data key boxed to our content key.
    pub async fn create(&self, title: &str, body: &str) -> SyncResult<Artifact> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut data_key = random_key_material();
        let boxed = self.encryption.encrypt_data_key(&data_key);
        data_key.zeroize();
        let boxed = boxed.map_err(|e| SyncError::encrypt("artifact key", e))?;

        let enc = self
            .encryption
            .initialize_artifact(&id, &boxed)
            .ok_or_else(|| SyncError::Decrypt {
                what: format!("artifact key {id}"),
            })?;
        let header = ArtifactHeader {
            title: Some(title.to_string()),
        };
        let content = ArtifactBody {
            body: Some(body.to_string()),
        };
        let request = CreateArtifactRequest {
            id: id.clone(),
            header: enc
                .encrypt_header(&header)
                .map_err(|e| SyncError::encrypt("artifact header", e))?,
            body: enc
                .encrypt_body(&content)
                .map_err(|e| SyncError::encrypt("artifact body", e))?,
            data_encryption_key: boxed,
        };

        let created = self.api.create_artifact(&request).await?;
        tracing::info!(artifact_id = %id, "artifact created");
        self.store(&created).ok_or_else(|| SyncError::Decrypt {
            what: format!("artifact {id}"),
        })
    }

    pub fn apply_update(&self, update: &UpdateEnvelope) {
        match &update.body {
            UpdateBody::NewArtifact {
                artifact_id,
                header,
                header_version,
                body,
                body_version,
                data_encryption_key,
                seq,
                created_at,
                updated_at,
            } => {
                let api = ApiArtifact {
                    id: artifact_id.clone(),
                    header: header.clone(),
                    header_version: *header_version,
                    body: body.clone(),
                    body_version: *body_version,
                    data_encryption_key: data_encryption_key.clone(),
                    seq: *seq,
                    created_at: *created_at,
                    updated_at: *updated_at,
                };
                if self.store(&api).is_none() {
                    tracing::warn!(artifact_id = %artifact_id, "cannot open artifact key, skipping");
                }
            }
            UpdateBody::UpdateArtifact {
                artifact_id,
                header,
                body,
            } => {
                let Some(enc) = self.encryption.artifact(artifact_id) else {
                    return;
                };
                let mut artifacts = lock(&self.artifacts);
                let Some(artifact) = artifacts.get_mut(artifact_id) else {
                    return;
                };
                if let Some(field) = header
                    && field.version > artifact.header_version
                {
                    artifact.header = enc.decrypt_header(field.version, &field.value);
                    artifact.header_version = field.version;
                }
                if let Some(field) = body
                    && artifact.body_version.is_none_or(|v| field.version > v)
                {
                    artifact.body = enc.decrypt_body(field.version, &field.value);
                    artifact.body_version = Some(field.version);
                }
                artifact.seq = artifact.seq.max(update.seq);
                artifact.updated_at = artifact.updated_at.max(update.created_at);
                self.publish(&artifacts);
            }
            UpdateBody::DeleteArtifact { artifact_id } => {
                self.encryption.remove_artifact(artifact_id);
                let mut artifacts = lock(&self.artifacts);
                if artifacts.remove(artifact_id).is_some() {
                    self.publish(&artifacts);
                }
            }
            _ => {}
        }
    }
}
