use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Encrypted payload wrappers
// ---------------------------------------------------------------------------

/// A versioned encrypted field. `version` is both the cache key and the
/// optimistic-concurrency token echoed back on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    /// Base64 ciphertext.
    pub value: String,
    pub version: u64,
}

/// Message content as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case")]
pub enum MessageContent {
    /// Base64 ciphertext of a [`crate::domain::RawRecord`].
    Encrypted { c: String },
    /// Legacy or unknown content tag. Never decrypted.
    #[serde(other)]
    Unsupported,
}

impl MessageContent {
    pub fn encrypted(c: impl Into<String>) -> Self {
        Self::Encrypted { c: c.into() }
    }
}

/// A session message as delivered by HTTP history and `new-message` pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMessage {
    pub id: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub content: MessageContent,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSession {
    pub id: String,
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub active: bool,
    pub active_at: u64,
    pub metadata: String,
    pub metadata_version: u64,
    #[serde(default)]
    pub agent_state: Option<String>,
    #[serde(default)]
    pub agent_state_version: u64,
    /// Base64 `version ‖ sealed box` of the session's AES-GCM data key.
    #[serde(default)]
    pub data_encryption_key: Option<String>,
    #[serde(default)]
    pub last_message: Option<ApiMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<ApiSession>,
}

/// History page, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<ApiMessage>,
}

// ---------------------------------------------------------------------------
// Machines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMachine {
    pub id: String,
    #[serde(default)]
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub active: bool,
    pub active_at: u64,
    pub metadata: String,
    pub metadata_version: u64,
    #[serde(default)]
    pub daemon_state: Option<String>,
    #[serde(default)]
    pub daemon_state_version: u64,
    #[serde(default)]
    pub data_encryption_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiArtifact {
    pub id: String,
    pub header: String,
    pub header_version: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_version: Option<u64>,
    pub data_encryption_key: String,
    #[serde(default)]
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArtifactRequest {
    pub id: String,
    pub header: String,
    pub body: String,
    pub data_encryption_key: String,
}

// ---------------------------------------------------------------------------
// Social
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    #[default]
    None,
    Requested,
    Pending,
    Friend,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub status: RelationshipStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendsResponse {
    pub friends: Vec<UserProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSearchResponse {
    pub users: Vec<UserProfile>,
}
