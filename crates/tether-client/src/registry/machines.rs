//! Machines (daemons) registered to the account.

use super::{Versioned, versioned_update};
use crate::api::SyncApi;
use crate::encryption::{Encryption, MachineEncryption};
use crate::error::{SyncError, SyncResult};
use crate::lock;
use crate::socket::{self, Transport};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tether_protocol::api::ApiMachine;
use tether_protocol::domain::{DaemonState, DaemonStatus, MachineMetadata};
use tether_protocol::frame::{MachineUpdateMetadataRequest, events};
use tether_protocol::rpc::{Empty, SpawnInDirectory, SpawnParams, SpawnResult, StopDaemon};
use tether_protocol::update::{UpdateBody, UpdateEnvelope};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub id: String,
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub active: bool,
    pub active_at: u64,
    pub metadata: Option<MachineMetadata>,
    pub metadata_version: u64,
    pub daemon_state: Option<DaemonState>,
    pub daemon_state_version: u64,
}

impl Machine {
    fn from_api(api: &ApiMachine, enc: &MachineEncryption) -> Self {
        Self {
            id: api.id.clone(),
            seq: api.seq,
            created_at: api.created_at,
            updated_at: api.updated_at,
            active: api.active,
            active_at: api.active_at,
            metadata: enc.decrypt_metadata(api.metadata_version, &api.metadata),
            metadata_version: api.metadata_version,
            daemon_state: enc
                .decrypt_daemon_state(api.daemon_state_version, api.daemon_state.as_deref()),
            daemon_state_version: api.daemon_state_version,
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.metadata {
            Some(m) => m.display_name.as_deref().unwrap_or(m.host.as_str()),
            None => self.id.as_str(),
        }
    }

    /// Whether the daemon reports itself running.
    pub fn is_running(&self) -> bool {
        self.daemon_state
            .as_ref()
            .is_some_and(|s| s.status == DaemonStatus::Running)
    }
}

pub struct MachineRegistry {
    api: Arc<dyn SyncApi>,
    transport: Arc<dyn Transport>,
    encryption: Arc<Encryption>,
    max_version_retries: u32,
    machines: Mutex<HashMap<String, Machine>>,
    /// Listed machines whose data key this account cannot open.
    unreadable: Mutex<HashSet<String>>,
    tx: watch::Sender<Arc<Vec<Machine>>>,
}

impl MachineRegistry {
    pub fn new(
        api: Arc<dyn SyncApi>,
        transport: Arc<dyn Transport>,
        encryption: Arc<Encryption>,
        max_version_retries: u32,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            api,
            transport,
            encryption,
            max_version_retries,
            machines: Mutex::new(HashMap::new()),
            unreadable: Mutex::new(HashSet::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Machine>>> {
        self.tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Machine> {
        lock(&self.machines).get(id).cloned()
    }

    pub fn list(&self) -> Arc<Vec<Machine>> {
        self.tx.borrow().clone()
    }

    fn publish(&self, machines: &HashMap<String, Machine>) {
        let mut list: Vec<Machine> = machines.values().cloned().collect();
        list.sort_by(|a, b| {
            b.active
                .cmp(&a.active)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        self.tx.send_replace(Arc::new(list));
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        let listed = self.api.list_machines().await?;
        self.encryption.initialize_machines(
            listed
                .iter()
                .map(|m| (m.id.clone(), m.data_encryption_key.clone())),
        );
        let mut fresh = HashMap::with_capacity(listed.len());
        let mut unreadable = HashSet::new();
        for api in &listed {
            match self.encryption.machine(&api.id) {
                Some(enc) => {
                    fresh.insert(api.id.clone(), Machine::from_api(api, &enc));
                }
                None => {
                    unreadable.insert(api.id.clone());
                }
            }
        }

        let mut machines = lock(&self.machines);
        *machines = fresh;
        *lock(&self.unreadable) = unreadable;
        self.publish(&machines);
        tracing::debug!(count = machines.len(), "machine list refreshed");
        Ok(())
    }

    /// Fold an `update-machine` push. Unknown machines trigger a refetch.
    pub async fn apply_update(&self, update: &UpdateEnvelope) -> SyncResult<()> {
        let UpdateBody::UpdateMachine {
            machine_id,
            metadata,
            daemon_state,
            active,
            active_at,
        } = &update.body
        else {
            return Ok(());
        };

        let enc = self.encryption.machine(machine_id);
        let known = {
            let mut machines = lock(&self.machines);
            match machines.get_mut(machine_id) {
                Some(machine) => {
                    if let Some(enc) = &enc {
                        if let Some(field) = metadata
                            && field.version > machine.metadata_version
                        {
                            machine.metadata = enc.decrypt_metadata(field.version, &field.value);
                            machine.metadata_version = field.version;
                        }
                        if let Some(field) = daemon_state
                            && field.version > machine.daemon_state_version
                        {
                            machine.daemon_state =
                                enc.decrypt_daemon_state(field.version, Some(&field.value));
                            machine.daemon_state_version = field.version;
                        }
                    }
                    if let Some(active) = active {
                        machine.active = *active;
                    }
                    if let Some(active_at) = active_at {
                        machine.active_at = *active_at;
                    }
                    machine.updated_at = machine.updated_at.max(update.created_at);
                    self.publish(&machines);
                    true
                }
                None => false,
            }
        };

        if known {
            return Ok(());
        }
        if lock(&self.unreadable).contains(machine_id) {
            tracing::debug!(machine_id = %machine_id, "update for unreadable machine");
            return Ok(());
        }
        tracing::debug!(machine_id = %machine_id, "update for unknown machine, refetching");
        self.refresh().await
    }

    /// Apply a `machine-activity` ephemeral.
    pub fn apply_activity(&self, machine_id: &str, active: bool, active_at: u64) {
        let mut machines = lock(&self.machines);
        if let Some(machine) = machines.get_mut(machine_id) {
            machine.active = active;
            machine.active_at = machine.active_at.max(active_at);
            self.publish(&machines);
        }
    }

    pub async fn update_metadata<F>(&self, machine_id: &str, f: F) -> SyncResult<MachineMetadata>
    where
        F: Fn(MachineMetadata) -> MachineMetadata,
    {
        let not_found = || SyncError::NotFound {
            kind: "machine",
            id: machine_id.to_string(),
        };
        let enc = self.encryption.machine(machine_id).ok_or_else(not_found)?;
        let base = {
            let machines = lock(&self.machines);
            let machine = machines.get(machine_id).ok_or_else(not_found)?;
            let value = machine.metadata.clone().ok_or_else(|| SyncError::Decrypt {
                what: format!("metadata of machine {machine_id}"),
            })?;
            Versioned {
                value,
                version: machine.metadata_version,
            }
        };

        let updated = versioned_update(
            self.transport.as_ref(),
            events::MACHINE_UPDATE_METADATA,
            "machine metadata",
            self.max_version_retries,
            base,
            |metadata, version| {
                let request = MachineUpdateMetadataRequest {
                    machine_id: machine_id.to_string(),
                    metadata: enc
                        .encrypt_metadata(metadata)
                        .map_err(|e| SyncError::encrypt("machine metadata", e))?,
                    expected_version: version,
                };
                serde_json::to_value(&request).map_err(|e| SyncError::protocol(e.to_string()))
            },
            |version, value| enc.decrypt_metadata(version, value?),
            f,
        )
        .await?;

        let mut machines = lock(&self.machines);
        if let Some(machine) = machines.get_mut(machine_id)
            && updated.version > machine.metadata_version
        {
            machine.metadata = Some(updated.value.clone());
            machine.metadata_version = updated.version;
            self.publish(&machines);
        }
        Ok(updated.value)
    }

    /// Ask the machine's daemon to start a session in `directory`.
    pub async fn spawn_in_directory(
        &self,
        machine_id: &str,
        directory: &str,
        approved_new_directory_creation: bool,
    ) -> SyncResult<SpawnResult> {
        let params = SpawnParams {
            directory: directory.to_string(),
            approved_new_directory_creation,
            agent: None,
        };
        let result = socket::rpc::<SpawnInDirectory>(
            self.transport.as_ref(),
            &self.encryption,
            machine_id,
            &params,
        )
        .await?;
        tracing::info!(machine_id = %machine_id, directory = %directory, "spawn requested");
        Ok(result)
    }

    pub async fn stop_daemon(&self, machine_id: &str) -> SyncResult<Value> {
        socket::rpc::<StopDaemon>(self.transport.as_ref(), &self.encryption, machine_id, &Empty {})
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::{FakeApi, ScriptedTransport};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tether_crypto::MasterSecret;
    use tether_protocol::api::EncryptedField;

    struct Fixture {
        api: Arc<FakeApi>,
        transport: Arc<ScriptedTransport>,
        enc: Arc<MachineEncryption>,
        registry: MachineRegistry,
    }

    fn metadata(host: &str) -> MachineMetadata {
        MachineMetadata {
            host: host.to_string(),
            platform: "linux".to_string(),
            home_dir: "/home/dev".to_string(),
            cli_version: None,
            display_name: None,
        }
    }

    fn fixture() -> Fixture {
        let api = Arc::new(FakeApi::default());
        let transport = Arc::new(ScriptedTransport::connected());
        let encryption = Arc::new(Encryption::new(&MasterSecret::generate()).unwrap());
        encryption.initialize_machines([("m1".to_string(), None)]);
        let enc = encryption.machine("m1").unwrap();
        api.machines.lock().unwrap().push(ApiMachine {
            id: "m1".to_string(),
            seq: 1,
            created_at: 1,
            updated_at: 1,
            active: false,
            active_at: 1,
            metadata: enc.encrypt_metadata(&metadata("devbox")).unwrap(),
            metadata_version: 1,
            daemon_state: None,
            daemon_state_version: 0,
            data_encryption_key: None,
        });
        let registry = MachineRegistry::new(api.clone(), transport.clone(), encryption, 5);
        Fixture {
            api,
            transport,
            enc,
            registry,
        }
    }

    #[tokio::test]
    async fn update_machine_patches_daemon_state() {
        let fx = fixture();
        fx.registry.refresh().await.unwrap();
        assert_eq!(fx.registry.get("m1").unwrap().display_name(), "devbox");

        let state = DaemonState {
            status: DaemonStatus::Running,
            pid: Some(42),
            http_port: None,
            started_at: None,
        };
        let update = UpdateEnvelope {
            id: "u1".to_string(),
            seq: 2,
            created_at: 50,
            body: UpdateBody::UpdateMachine {
                machine_id: "m1".to_string(),
                metadata: None,
                daemon_state: Some(EncryptedField {
                    value: fx.enc.encrypt_daemon_state(&state).unwrap(),
                    version: 1,
                }),
                active: Some(true),
                active_at: Some(50),
            },
        };
        fx.registry.apply_update(&update).await.unwrap();

        let machine = fx.registry.get("m1").unwrap();
        assert!(machine.is_running());
        assert!(machine.active);
        assert_eq!(machine.daemon_state.unwrap().pid, Some(42));
    }

    #[tokio::test]
    async fn unknown_machine_update_refetches() {
        let fx = fixture();
        let update = UpdateEnvelope {
            id: "u1".to_string(),
            seq: 2,
            created_at: 50,
            body: UpdateBody::UpdateMachine {
                machine_id: "m1".to_string(),
                metadata: None,
                daemon_state: None,
                active: Some(true),
                active_at: None,
            },
        };
        fx.registry.apply_update(&update).await.unwrap();
        assert!(fx.registry.get("m1").is_some());
        assert_eq!(fx.api.machines.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_machine_pushes_do_not_refetch() {
        let fx = fixture();
        let other_account = Encryption::new(&MasterSecret::generate()).unwrap();
        let foreign_key = other_account
            .encrypt_data_key(&tether_crypto::keys::random_key_material())
            .unwrap();
        fx.api.machines.lock().unwrap().push(ApiMachine {
            id: "m9".to_string(),
            seq: 1,
            created_at: 1,
            updated_at: 1,
            active: true,
            active_at: 1,
            metadata: "AA==".to_string(),
            metadata_version: 1,
            daemon_state: None,
            daemon_state_version: 0,
            data_encryption_key: Some(foreign_key),
        });
        fx.registry.refresh().await.unwrap();
        assert!(fx.registry.get("m9").is_none());

        for active_at in [10, 20] {
            let update = UpdateEnvelope {
                id: format!("u{active_at}"),
                seq: active_at,
                created_at: active_at,
                body: UpdateBody::UpdateMachine {
                    machine_id: "m9".to_string(),
                    metadata: None,
                    daemon_state: None,
                    active: Some(true),
                    active_at: Some(active_at),
                },
            };
            fx.registry.apply_update(&update).await.unwrap();
        }
        assert_eq!(fx.api.machine_lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_decodes_typed_result() {
        let fx = fixture();
        let reply = SpawnResult::RequestToApproveDirectoryCreation {
            directory: "/tmp/new".to_string(),
        };
        fx.transport
            .reply(json!({"ok": true, "result": fx.enc.encrypt_raw(&reply).unwrap()}));

        let result = fx
            .registry
            .spawn_in_directory("m1", "/tmp/new", false)
            .await
            .unwrap();
        assert_eq!(result, reply);
        assert_eq!(
            fx.transport.calls.lock().unwrap()[0].1["method"],
            "m1:spawn-in-directory"
        );
    }

    #[tokio::test]
    async fn metadata_update_uses_machine_event() {
        let fx = fixture();
        fx.registry.refresh().await.unwrap();
        fx.transport.reply(json!({"result": "success", "version": 2}));

        let updated = fx
            .registry
            .update_metadata("m1", |mut m| {
                m.display_name = Some("Build box".to_string());
                m
            })
            .await
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Build box"));

        let calls = fx.transport.calls.lock().unwrap();
        assert_eq!(calls[0].0, events::MACHINE_UPDATE_METADATA);
        assert_eq!(calls[0].1["machineId"], "m1");
        assert_eq!(calls[0].1["expectedVersion"], 1);
        drop(calls);
        assert_eq!(fx.registry.get("m1").unwrap().metadata_version, 2);
    }
}
