//! Account-wide and per-session state holders.

pub mod artifacts;
pub mod machines;
pub mod session;
pub mod sessions;

pub use artifacts::{Artifact, ArtifactRegistry};
pub use machines::{Machine, MachineRegistry};
pub use session::{SessionSync, SessionView};
pub use sessions::{Presence, Session, SessionUsage, SessionsRegistry};

use crate::error::{SyncError, SyncResult};
use crate::socket::Transport;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tether_protocol::frame::VersionedAck;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One field under optimistic concurrency.
#[derive(Debug)]
pub(crate) struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Apply `update` to a versioned field through `event`.
///
/// On `version-mismatch` the server's value becomes the new base and the
/// update is re-applied, up to `max_attempts` round trips.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn versioned_update<T, B, D, F>(
    transport: &dyn Transport,
    event: &str,
    field: &str,
    max_attempts: u32,
    mut current: Versioned<T>,
    build: B,
    decode: D,
    update: F,
) -> SyncResult<Versioned<T>>
where
    T: Clone,
    B: Fn(&T, u64) -> SyncResult<Value>,
    D: Fn(u64, Option<&str>) -> Option<T>,
    F: Fn(T) -> T,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let next = update(current.value.clone());
        let request = build(&next, current.version)?;
        let ack = transport.call(event, request).await?;
        let ack: VersionedAck = serde_json::from_value(ack)
            .map_err(|e| SyncError::protocol(format!("malformed {event} ack: {e}")))?;

        match ack {
            VersionedAck::Success { version, .. } => {
                return Ok(Versioned {
                    value: next,
                    version,
                });
            }
            VersionedAck::VersionMismatch { version, value } => {
                tracing::debug!(event, field, attempt, version, "version mismatch, merging");
                let Some(server_value) = decode(version, value.as_deref()) else {
                    return Err(SyncError::Decrypt {
                        what: format!("{field} v{version}"),
                    });
                };
                current = Versioned {
                    value: server_value,
                    version,
                };
            }
            VersionedAck::Error { message } => {
                return Err(SyncError::Rpc {
                    method: event.to_string(),
                    message: message.unwrap_or_else(|| "update rejected".to_string()),
                });
            }
        }
    }
    Err(SyncError::VersionConflict {
        field: field.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for registry tests.

    use super::*;
    use crate::api::SyncApi;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_protocol::api::{
        ApiArtifact, ApiMachine, ApiMessage, ApiSession, CreateArtifactRequest, UserProfile,
    };

    #[derive(Default)]
    pub struct ScriptedTransport {
        pub replies: Mutex<VecDeque<SyncResult<Value>>>,
        pub calls: Mutex<Vec<(String, Value)>>,
        pub sent: Mutex<Vec<(String, Value)>>,
        pub connected: bool,
    }

    impl ScriptedTransport {
        pub fn connected() -> Self {
            Self {
                connected: true,
                ..Self::default()
            }
        }

        pub fn reply(&self, value: Value) {
            self.replies.lock().unwrap().push_back(Ok(value));
        }
    }

    /// In-memory HTTP side. `message_failures` failed history fetches are
    /// served before the first success.
    #[derive(Default)]
    pub struct FakeApi {
        pub sessions: Mutex<Vec<ApiSession>>,
        pub messages: Mutex<HashMap<String, Vec<ApiMessage>>>,
        pub machines: Mutex<Vec<ApiMachine>>,
        pub artifacts: Mutex<Vec<ApiArtifact>>,
        pub created: Mutex<Vec<CreateArtifactRequest>>,
        pub session_lists: AtomicUsize,
        pub machine_lists: AtomicUsize,
        pub message_fetches: AtomicUsize,
        pub message_failures: AtomicUsize,
    }

    #[async_trait]
    impl SyncApi for FakeApi {
        async fn list_sessions(&self) -> SyncResult<Vec<ApiSession>> {
            self.session_lists.fetch_add(1, Ordering::SeqCst);
            Ok(self.sessions.lock().unwrap().clone())
        }

        async fn session_messages(&self, session_id: &str) -> SyncResult<Vec<ApiMessage>> {
            self.message_fetches.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .message_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SyncError::Http {
                    status: Some(503),
                    message: "unavailable".to_string(),
                });
            }
            Ok(self
                .messages
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn list_machines(&self) -> SyncResult<Vec<ApiMachine>> {
            self.machine_lists.fetch_add(1, Ordering::SeqCst);
            Ok(self.machines.lock().unwrap().clone())
        }

        async fn list_artifacts(&self) -> SyncResult<Vec<ApiArtifact>> {
            Ok(self.artifacts.lock().unwrap().clone())
        }

        async fn get_artifact(&self, artifact_id: &str) -> SyncResult<ApiArtifact> {
            self.artifacts
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.id == artifact_id)
                .cloned()
                .ok_or(SyncError::Http {
                    status: Some(404),
                    message: artifact_id.to_string(),
                })
        }

        async fn create_artifact(&self, request: &CreateArtifactRequest) -> SyncResult<ApiArtifact> {
            self.created.lock().unwrap().push(request.clone());
            let artifact = ApiArtifact {
                id: request.id.clone(),
                header: request.header.clone(),
                header_version: 1,
                body: Some(request.body.clone()),
                body_version: Some(1),
                data_encryption_key: request.data_encryption_key.clone(),
                seq: 1,
                created_at: 1_000,
                updated_at: 1_000,
            };
            self.artifacts.lock().unwrap().push(artifact.clone());
            Ok(artifact)
        }

        async fn friends(&self) -> SyncResult<Vec<UserProfile>> {
            Ok(Vec::new())
        }

        async fn search_users(&self, _query: &str) -> SyncResult<Vec<UserProfile>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(&self, event: &str, data: Value) -> SyncResult<Value> {
            self.calls.lock().unwrap().push((event.to_string(), data));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(SyncError::Disconnected))
        }

        fn send(&self, event: &str, data: Value) -> bool {
            if !self.connected {
                return false;
            }
            self.sent.lock().unwrap().push((event.to_string(), data));
            true
        }
    }
}
