use crate::api::{ApiMessage, EncryptedField, RelationshipStatus};
use serde::{Deserialize, Serialize};

/// Durable server push, carried on the `update` socket event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    pub id: String,
    pub seq: u64,
    pub body: UpdateBody,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum UpdateBody {
    NewMessage {
        sid: String,
        message: ApiMessage,
    },
    /// Only `id` is guaranteed; a push without metadata or timestamps
    /// means the client should refetch the list.
    NewSession {
        id: String,
        #[serde(default)]
        seq: u64,
        #[serde(default)]
        metadata: Option<String>,
        #[serde(default)]
        metadata_version: u64,
        #[serde(default)]
        agent_state: Option<String>,
        #[serde(default)]
        agent_state_version: u64,
        #[serde(default)]
        data_encryption_key: Option<String>,
        #[serde(default)]
        active: bool,
        #[serde(default)]
        active_at: u64,
        #[serde(default)]
        created_at: Option<u64>,
        #[serde(default)]
        updated_at: Option<u64>,
    },
    DeleteSession {
        sid: String,
    },
    UpdateSession {
        id: String,
        #[serde(default)]
        metadata: Option<EncryptedField>,
        #[serde(default)]
        agent_state: Option<EncryptedField>,
        #[serde(default)]
        active: Option<bool>,
        #[serde(default)]
        active_at: Option<u64>,
    },
    UpdateAccount {
        id: String,
        #[serde(default)]
        settings: Option<EncryptedField>,
        #[serde(default)]
        first_name: Option<String>,
        #[serde(default)]
        last_name: Option<String>,
    },
    UpdateMachine {
        machine_id: String,
        #[serde(default)]
        metadata: Option<EncryptedField>,
        #[serde(default)]
        daemon_state: Option<EncryptedField>,
        #[serde(default)]
        active: Option<bool>,
        #[serde(default)]
        active_at: Option<u64>,
    },
    NewArtifact {
        artifact_id: String,
        header: String,
        header_version: u64,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        body_version: Option<u64>,
        data_encryption_key: String,
        seq: u64,
        created_at: u64,
        updated_at: u64,
    },
    UpdateArtifact {
        artifact_id: String,
        #[serde(default)]
        header: Option<EncryptedField>,
        #[serde(default)]
        body: Option<EncryptedField>,
    },
    DeleteArtifact {
        artifact_id: String,
    },
    RelationshipUpdated {
        from_user_id: String,
        to_user_id: String,
        status: RelationshipStatus,
        timestamp: u64,
    },
}

impl UpdateBody {
    /// Short name for logging, matching the wire tag.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateBody::NewMessage { .. } => "new-message",
            UpdateBody::NewSession { .. } => "new-session",
            UpdateBody::DeleteSession { .. } => "delete-session",
            UpdateBody::UpdateSession { .. } => "update-session",
            UpdateBody::UpdateAccount { .. } => "update-account",
            UpdateBody::UpdateMachine { .. } => "update-machine",
            UpdateBody::NewArtifact { .. } => "new-artifact",
            UpdateBody::UpdateArtifact { .. } => "update-artifact",
            UpdateBody::DeleteArtifact { .. } => "delete-artifact",
            UpdateBody::RelationshipUpdated { .. } => "relationship-updated",
        }
    }
}

// ---------------------------------------------------------------------------
// Ephemeral updates
// ---------------------------------------------------------------------------

/// Non-durable push on the `ephemeral` socket event. Never persisted or retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EphemeralUpdate {
    Activity {
        id: String,
        active: bool,
        active_at: u64,
        #[serde(default)]
        thinking: bool,
    },
    Usage {
        id: String,
        key: String,
        tokens: UsageTokens,
        cost: UsageCost,
        timestamp: u64,
    },
    MachineActivity {
        id: String,
        active: bool,
        active_at: u64,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageTokens {
    pub total: u64,
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCost {
    pub total: f64,
    pub input: f64,
    pub output: f64,
}
