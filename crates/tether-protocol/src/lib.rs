//! Wire contract between tether clients and the sync server.
//!
//! Everything the server can see lives in [`api`], [`update`] and [`frame`]:
//! ids, sequence numbers, timestamps and base64 ciphertext. The plaintext
//! schemas that live inside the ciphertext are in [`domain`] and [`rpc`].

pub mod api;
pub mod domain;
pub mod frame;
pub mod rpc;
pub mod update;

/// Default sync server.
pub const DEFAULT_ENDPOINT: &str = "https://sync.tether.dev";

/// Path of the persistent update socket.
pub const UPDATES_PATH: &str = "/v1/updates";
