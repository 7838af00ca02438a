use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tether_client::Encryption;
use tether_crypto::MasterSecret;
use tether_crypto::keys::random_key_material;
use tether_protocol::api::{ApiMachine, ApiMessage, ApiSession, MessageContent};
use tether_protocol::domain::{AgentContent, ContentBlock, MachineMetadata, Metadata, RawRecord};
use tether_protocol::frame::RpcAck;
use tether_protocol::rpc::RpcTarget;

use super::server::now_ms;

/// The daemon's view of an account: same secret as the client under test,
/// its own encryption state. Builds ciphertext the way a daemon would.
pub struct TestAccount {
    secret: MasterSecret,
    encryption: Arc<Encryption>,
}

impl Default for TestAccount {
    fn default() -> Self {
        Self::new()
    }
}

impl TestAccount {
    pub fn new() -> Self {
        let secret = MasterSecret::generate();
        let encryption = Arc::new(Encryption::new(&secret).unwrap());
        Self { secret, encryption }
    }

    pub fn secret(&self) -> &MasterSecret {
        &self.secret
    }

    /// A session under a fresh data key, with metadata pointing at `path`.
    pub fn session(&self, id: &str, path: &str) -> ApiSession {
        let data_key = self
            .encryption
            .encrypt_data_key(&random_key_material())
            .unwrap();
        self.encryption
            .initialize_sessions([(id.to_string(), Some(data_key.clone()))]);
        let enc = self.encryption.session(id).unwrap();
        let now = now_ms();
        ApiSession {
            id: id.to_string(),
            seq: 0,
            created_at: now,
            updated_at: now,
            active: true,
            active_at: now,
            metadata: enc.encrypt_metadata(&metadata(path)).unwrap(),
            metadata_version: 1,
            agent_state: None,
            agent_state_version: 0,
            data_encryption_key: Some(data_key),
            last_message: None,
        }
    }

    pub fn machine(&self, id: &str, host: &str) -> ApiMachine {
        let data_key = self
            .encryption
            .encrypt_data_key(&random_key_material())
            .unwrap();
        self.encryption
            .initialize_machines([(id.to_string(), Some(data_key.clone()))]);
        let enc = self.encryption.machine(id).unwrap();
        let metadata = MachineMetadata {
            host: host.to_string(),
            platform: "linux".to_string(),
            home_dir: "/home/dev".to_string(),
            cli_version: None,
            display_name: None,
        };
        let now = now_ms();
        ApiMachine {
            id: id.to_string(),
            seq: 0,
            created_at: now,
            updated_at: now,
            active: true,
            active_at: now,
            metadata: enc.encrypt_metadata(&metadata).unwrap(),
            metadata_version: 1,
            daemon_state: None,
            daemon_state_version: 0,
            data_encryption_key: Some(data_key),
        }
    }

    /// An encrypted history entry for a session created by [`Self::session`].
    pub fn message(&self, session_id: &str, id: &str, seq: u64, record: &RawRecord) -> ApiMessage {
        let enc = self.encryption.session(session_id).unwrap();
        ApiMessage {
            id: id.to_string(),
            seq,
            local_id: None,
            content: MessageContent::encrypted(enc.encrypt_raw_record(record).unwrap()),
            created_at: now_ms(),
        }
    }

    pub fn agent_text(&self, session_id: &str, id: &str, seq: u64, text: &str) -> ApiMessage {
        let record = RawRecord::agent(AgentContent::Output {
            blocks: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        });
        self.message(session_id, id, seq, &record)
    }

    pub fn user_text(&self, session_id: &str, id: &str, seq: u64, text: &str) -> ApiMessage {
        self.message(session_id, id, seq, &RawRecord::user_text(text, None))
    }

    /// Decrypt a stored message the way the daemon reads it.
    pub fn read(&self, session_id: &str, message: &ApiMessage) -> Option<RawRecord> {
        self.encryption
            .session(session_id)?
            .decrypt_message(message)
            .content
    }

    /// RPC handler answering as the target's daemon would: decrypt params,
    /// run `f`, encrypt the result.
    pub fn answer<P, R, F>(
        &self,
        target: RpcTarget,
        target_id: &str,
        f: F,
    ) -> impl Fn(&str) -> RpcAck + Send + Sync + 'static + use<P, R, F>
    where
        P: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(P) -> R + Send + Sync + 'static,
    {
        let encryption = self.encryption.clone();
        let id = target_id.to_string();
        move |params: &str| {
            let Some(cipher) = encryption.rpc_cipher(target, &id) else {
                return failure("unknown rpc target");
            };
            let Some(params) = cipher.decrypt_json::<P>(params) else {
                return failure("cannot decrypt params");
            };
            match cipher.encrypt_json(&f(params)) {
                Ok(result) => RpcAck {
                    ok: true,
                    result: Some(result),
                    error: None,
                },
                Err(err) => failure(&err.to_string()),
            }
        }
    }
}

fn failure(message: &str) -> RpcAck {
    RpcAck {
        ok: false,
        result: None,
        error: Some(message.to_string()),
    }
}

fn metadata(path: &str) -> Metadata {
    Metadata {
        path: path.to_string(),
        host: "devbox".to_string(),
        name: None,
        os: Some("linux".to_string()),
        summary: None,
        machine_id: None,
        home_dir: Some("/home/dev".to_string()),
        flavor: None,
    }
}
