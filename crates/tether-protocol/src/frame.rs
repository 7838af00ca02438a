use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum size of a single socket text frame (8 MiB).
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// One JSON text frame on the update socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Fire-and-forget event, either direction.
    Emit { event: String, data: Value },
    /// Client request that expects exactly one [`Frame::Ack`] with the same id.
    Call { id: u64, event: String, data: Value },
    /// Server acknowledgement of a [`Frame::Call`].
    Ack { id: u64, data: Value },
}

/// Socket event names.
pub mod events {
    /// Server → client durable update ([`crate::update::UpdateEnvelope`]).
    pub const UPDATE: &str = "update";
    /// Server → client ephemeral update ([`crate::update::EphemeralUpdate`]).
    pub const EPHEMERAL: &str = "ephemeral";
    /// Client → server user message ([`super::OutgoingMessage`]).
    pub const MESSAGE: &str = "message";
    /// Client → server encrypted RPC ([`super::RpcCall`]).
    pub const RPC_CALL: &str = "rpc-call";
    /// Versioned session metadata update.
    pub const UPDATE_METADATA: &str = "update-metadata";
    /// Versioned session agent-state update.
    pub const UPDATE_STATE: &str = "update-state";
    /// Versioned machine metadata update.
    pub const MACHINE_UPDATE_METADATA: &str = "machine-update-metadata";
}

/// Payload of the `message` emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sid: String,
    /// Base64 ciphertext of a [`crate::domain::RawRecord`].
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

/// Payload of the `rpc-call` call. `method` is scoped as `{target_id}:{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    pub method: String,
    /// Base64 ciphertext of the method params.
    pub params: String,
}

/// Ack of an `rpc-call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcAck {
    pub ok: bool,
    /// Base64 ciphertext of the method result.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `update-metadata` call payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadataRequest {
    pub sid: String,
    /// Base64 ciphertext of the new [`crate::domain::Metadata`].
    pub metadata: String,
    pub expected_version: u64,
}

/// `update-state` call payload. `agent_state: None` clears the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStateRequest {
    pub sid: String,
    pub agent_state: Option<String>,
    pub expected_version: u64,
}

/// `machine-update-metadata` call payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineUpdateMetadataRequest {
    pub machine_id: String,
    pub metadata: String,
    pub expected_version: u64,
}

/// Ack of a versioned update. The server echoes the field under its own
/// name (`metadata` or `agentState`), folded here into `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum VersionedAck {
    Success {
        version: u64,
        #[serde(default, alias = "metadata", alias = "agentState")]
        value: Option<String>,
    },
    /// The server holds a newer value; merge onto it and retry.
    VersionMismatch {
        version: u64,
        #[serde(default, alias = "metadata", alias = "agentState")]
        value: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}
