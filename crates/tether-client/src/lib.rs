//! End-to-end encrypted session sync.
//!
//! [`SyncEngine`] connects to the server's update socket, keeps the account's
//! sessions, machines and artifacts decrypted in memory, and folds each open
//! session's message log into a UI-ready timeline. The server only ever sees
//! ciphertext.

pub mod activity;
pub mod api;
pub mod config;
pub mod encryption;
pub mod error;
pub mod file_index;
pub mod reducer;
pub mod registry;
pub mod socket;
pub mod sync;

pub use activity::{AccumulatorConfig, ActivityAccumulator, ActivityUpdate};
pub use api::{HttpApi, SyncApi};
pub use config::ClientConfig;
pub use encryption::{DecryptedMessage, Encryption};
pub use error::{SyncError, SyncResult};
pub use file_index::{FileMatch, FileSearchIndex};
pub use reducer::{Message, Reducer, ReducerState, ViewItem, group_tool_calls};
pub use registry::{
    Artifact, ArtifactRegistry, Machine, MachineRegistry, Presence, Session, SessionSync,
    SessionView, SessionsRegistry,
};
pub use socket::{ConnectionState, SyncSocket, Transport};
pub use sync::{SyncEngine, SyncEvent};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
