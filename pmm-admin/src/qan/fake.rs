//! In-memory QAN API with the quirks of the real one: lookups ignore
//! `parent_uuid`, and agents answer only after a number of 404s.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use chrono::Utc;
use shared::types::AgentInstance;
use crate::error::{AdminError, Result, Subsystem};
use crate::qan::agent::{AgentConfig, AgentInstaller};
use crate::qan::{AgentCommand, QanApi, RelayOutcome};

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, AgentInstance>,
    next_id: u32,
    /// 404s left before the agent counts as connected
    not_connected_for: u32,
    /// Agent never connects
    agent_absent: bool,
    ignore_undelete: bool,
    fail_delete: bool,
    commands: Vec<(String, AgentCommand)>,
    relay_attempts: u32,
}

#[derive(Default)]
pub struct FakeQan {
    inner: Mutex<Inner>,
}

impl FakeQan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance: AgentInstance) {
        self.inner
            .lock()
            .unwrap()
            .instances
            .insert(instance.uuid.clone(), instance);
    }

    pub fn instance(&self, uuid: &str) -> Option<AgentInstance> {
        self.inner.lock().unwrap().instances.get(uuid).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }

    /// Soft-delete behind the client's back.
    pub fn soft_delete(&self, uuid: &str) {
        if let Some(i) = self.inner.lock().unwrap().instances.get_mut(uuid) {
            i.deleted_at = Some(Utc::now());
        }
    }

    pub fn connect_agent_after(&self, not_found_replies: u32) {
        self.inner.lock().unwrap().not_connected_for = not_found_replies;
    }

    pub fn agent_never_connects(&self) {
        self.inner.lock().unwrap().agent_absent = true;
    }

    pub fn agent_connects(&self) {
        self.inner.lock().unwrap().agent_absent = false;
    }

    pub fn ignore_undelete(&self) {
        self.inner.lock().unwrap().ignore_undelete = true;
    }

    pub fn fail_next_delete(&self) {
        self.inner.lock().unwrap().fail_delete = true;
    }

    pub fn commands(&self) -> Vec<(String, AgentCommand)> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn relay_attempts(&self) -> u32 {
        self.inner.lock().unwrap().relay_attempts
    }
}

#[async_trait]
impl QanApi for FakeQan {
    async fn ping(&self) -> Result<String> {
        Ok("fake".to_string())
    }

    async fn find_instance(
        &self,
        subsystem: &str,
        name: &str,
        _parent_uuid: &str,
    ) -> Result<Option<AgentInstance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .instances
            .values()
            .find(|i| i.subsystem == subsystem && i.name == name)
            .cloned())
    }

    async fn list_instances(&self) -> Result<Vec<AgentInstance>> {
        Ok(self.inner.lock().unwrap().instances.values().cloned().collect())
    }

    async fn get_instance(&self, uuid: &str) -> Result<Option<AgentInstance>> {
        Ok(self.instance(uuid))
    }

    async fn create_instance(&self, instance: &AgentInstance) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let uuid = format!("inst-{}", inner.next_id);
        let mut created = instance.clone();
        created.uuid = uuid.clone();
        created.created_at = Some(Utc::now());
        created.deleted_at = None;
        inner.instances.insert(uuid.clone(), created);
        Ok(uuid)
    }

    async fn update_instance(&self, instance: &AgentInstance) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ignore_undelete = inner.ignore_undelete;
        let Some(existing) = inner.instances.get_mut(&instance.uuid) else {
            return Err(AdminError::RemoteApi {
                subsystem: Subsystem::QanApi,
                method: "PUT".to_string(),
                url: format!("/instances/{}", instance.uuid),
                status: 404,
                body: "not found".to_string(),
            });
        };
        let deleted_at = existing.deleted_at;
        *existing = instance.clone();
        if ignore_undelete {
            existing.deleted_at = deleted_at;
        }
        Ok(())
    }

    async fn delete_instance(&self, uuid: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.fail_delete) {
            return Err(AdminError::RemoteApi {
                subsystem: Subsystem::QanApi,
                method: "DELETE".to_string(),
                url: format!("/instances/{}", uuid),
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        if let Some(i) = inner.instances.get_mut(uuid) {
            i.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn send_command(&self, agent_uuid: &str, cmd: &AgentCommand) -> Result<RelayOutcome> {
        let mut inner = self.inner.lock().unwrap();
        inner.relay_attempts += 1;
        if inner.agent_absent {
            return Ok(RelayOutcome::AgentNotConnected);
        }
        if inner.not_connected_for > 0 {
            inner.not_connected_for -= 1;
            return Ok(RelayOutcome::AgentNotConnected);
        }
        inner.commands.push((agent_uuid.to_string(), cmd.clone()));
        Ok(RelayOutcome::Delivered(Vec::new()))
    }
}

/// Registers agents on a [`FakeQan`], failing the first `fail_first` runs.
/// Every run, failed or not, leaves a `data/run-<n>` file behind.
pub struct FakeInstaller {
    runs: AtomicU32,
    fail_first: u32,
    api: Arc<FakeQan>,
}

impl FakeInstaller {
    pub fn new(api: Arc<FakeQan>, fail_first: u32) -> Self {
        Self {
            runs: AtomicU32::new(0),
            fail_first,
            api,
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentInstaller for FakeInstaller {
    async fn install(&self, base: &Path) -> Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        std::fs::create_dir_all(base.join("data"))?;
        std::fs::write(base.join("data").join(format!("run-{}", run)), b"partial")?;
        if run <= self.fail_first {
            return Err(AdminError::AgentRegistration {
                reason: "installer crashed".to_string(),
            });
        }

        let uuid = format!("agent-{}", run);
        self.api.insert(AgentInstance {
            uuid: uuid.clone(),
            subsystem: "agent".to_string(),
            parent_uuid: "os-1".to_string(),
            name: "host".to_string(),
            ..Default::default()
        });
        std::fs::create_dir_all(base.join("config"))?;
        let config = AgentConfig {
            agent_uuid: uuid,
            api_hostname: "pmm".to_string(),
        };
        std::fs::write(base.join("config").join("agent.conf"), serde_json::to_vec(&config)?)?;
        Ok(())
    }
}
