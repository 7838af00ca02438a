//! Typed RPC surface. Each method is a zero-sized marker pairing a wire name
//! with its params and result schema; both travel encrypted end-to-end.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which entity's key encrypts the call and which id scopes the method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    Session,
    Machine,
}

pub trait RpcMethod {
    const NAME: &'static str;
    const TARGET: RpcTarget;
    type Params: Serialize + Send + Sync;
    type Result: DeserializeOwned + Send;
}

/// Method name as sent on the wire: `{target_id}:{name}`.
pub fn scoped_method<M: RpcMethod>(target_id: &str) -> String {
    format!("{target_id}:{}", M::NAME)
}

macro_rules! rpc_method {
    ($ty:ident, $name:literal, $target:ident, $params:ty => $result:ty) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $ty;

        impl RpcMethod for $ty {
            const NAME: &'static str = $name;
            const TARGET: RpcTarget = RpcTarget::$target;
            type Params = $params;
            type Result = $result;
        }
    };
}

// ---------------------------------------------------------------------------
// Machine methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnParams {
    pub directory: String,
    #[serde(default)]
    pub approved_new_directory_creation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SpawnResult {
    Success { session_id: String },
    /// The directory does not exist; retry with approval to create it.
    RequestToApproveDirectoryCreation { directory: String },
    Error { error_message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

rpc_method!(SpawnInDirectory, "spawn-in-directory", Machine, SpawnParams => SpawnResult);
rpc_method!(StopDaemon, "stop-daemon", Machine, Empty => Value);

// ---------------------------------------------------------------------------
// Session control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortParams {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionParams {
    /// Tool-call id being answered.
    pub id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchParams {
    /// `local` or `remote`.
    pub to: String,
}

rpc_method!(Abort, "abort", Session, AbortParams => Value);
rpc_method!(Permission, "permission", Session, PermissionParams => Value);
rpc_method!(Switch, "switch", Session, SwitchParams => Value);
rpc_method!(KillSession, "killSession", Session, Empty => SimpleResult);

// ---------------------------------------------------------------------------
// Workspace access
// ---------------------------------------------------------------------------

/// Generic `{success, error?}` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BashParams {
    pub command: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashResult {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathParams {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFileResult {
    pub success: bool,
    /// Base64 file content.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileParams {
    pub path: String,
    /// Base64 file content.
    pub content: String,
    /// Hash of the content being replaced; `None` means the file must not exist.
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileResult {
    pub success: bool,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDirectoryResult {
    pub success: bool,
    #[serde(default)]
    pub entries: Vec<DirectoryEntry>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeParams {
    pub path: String,
    pub max_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeResult {
    pub success: bool,
    #[serde(default)]
    pub tree: Option<TreeNode>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RipgrepParams {
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RipgrepResult {
    pub success: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
}

rpc_method!(Bash, "bash", Session, BashParams => BashResult);
rpc_method!(ReadFile, "readFile", Session, PathParams => ReadFileResult);
rpc_method!(WriteFile, "writeFile", Session, WriteFileParams => WriteFileResult);
rpc_method!(ListDirectory, "listDirectory", Session, PathParams => ListDirectoryResult);
rpc_method!(GetDirectoryTree, "getDirectoryTree", Session, TreeParams => TreeResult);
rpc_method!(Ripgrep, "ripgrep", Session, RipgrepParams => RipgrepResult);
