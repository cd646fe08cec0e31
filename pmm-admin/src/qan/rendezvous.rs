//! QAN instance lifecycle and the agent command relay.
//!
//! An instance moves `Unknown -> lookup -> {NotFound, FoundActive,
//! FoundSoftDeleted} -> Reconciled`. The remote API is trusted as little as
//! possible: lookups are re-verified, undeletes are re-read, and the UUID of
//! a new instance comes from the record behind `Location`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use shared::dsn;
use shared::protocol::{CMD_START_TOOL, CMD_STOP_TOOL};
use shared::types::{AgentInstance, Subsystem};
use crate::error::{AdminError, Result, Subsystem as Store};
use crate::qan::retry::{Attempt, RetryPolicy};
use crate::qan::{AgentCommand, QanApi, RelayOutcome};

/// What a lookup found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    NotFound,
    FoundActive(AgentInstance),
    FoundSoftDeleted(AgentInstance),
}

/// Identity of the instance to find or create.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub subsystem: Subsystem,
    pub name: String,
    pub parent_uuid: String,
    /// Unsanitized; only the local instance file sees it
    pub dsn: String,
    pub distro: String,
    pub version: String,
}

/// Payload of `StartTool`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ToolConfig {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collect_from: Option<String>,
    pub interval: u32,
    pub example_queries: bool,
}

impl ToolConfig {
    pub fn new(subsystem: Subsystem, uuid: impl Into<String>, query_source: Option<&str>) -> Self {
        let collect_from = match subsystem {
            Subsystem::Mysql => Some(query_source.unwrap_or("slowlog").to_string()),
            Subsystem::Mongo => None,
        };
        Self {
            uuid: uuid.into(),
            collect_from,
            interval: 60,
            example_queries: true,
        }
    }
}

pub struct AgentRendezvous {
    api: Arc<dyn QanApi>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    instance_dir: PathBuf,
    user: String,
}

impl AgentRendezvous {
    pub fn new(
        api: Arc<dyn QanApi>,
        instance_dir: impl Into<PathBuf>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            instance_dir: instance_dir.into(),
            user: user.into(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn api(&self) -> &Arc<dyn QanApi> {
        &self.api
    }

    pub async fn lookup(
        &self,
        subsystem: Subsystem,
        name: &str,
        parent_uuid: &str,
    ) -> Result<Lookup> {
        let found = self
            .api
            .find_instance(subsystem.as_str(), name, parent_uuid)
            .await?;
        let Some(instance) = found else {
            return Ok(Lookup::NotFound);
        };

        // The list filter may ignore parent_uuid and hand back the first
        // instance with that name anywhere. Fall back to the full list.
        let instance = if is_same(&instance, subsystem, name, parent_uuid) {
            instance
        } else {
            tracing::debug!(
                "Lookup for {} {} returned {} of parent {}; scanning all instances",
                subsystem,
                name,
                instance.uuid,
                instance.parent_uuid
            );
            let mut matches: Vec<AgentInstance> = self
                .api
                .list_instances()
                .await?
                .into_iter()
                .filter(|i| is_same(i, subsystem, name, parent_uuid))
                .collect();
            // An active instance wins over soft-deleted ones.
            matches.sort_by_key(AgentInstance::is_deleted);
            match matches.into_iter().next() {
                Some(instance) => instance,
                None => return Ok(Lookup::NotFound),
            }
        };

        if instance.is_deleted() {
            Ok(Lookup::FoundSoftDeleted(instance))
        } else {
            Ok(Lookup::FoundActive(instance))
        }
    }

    /// Find, undelete or create the instance, then write the local instance
    /// file carrying the real DSN. The returned instance holds the real DSN.
    pub async fn find_or_create(&self, req: &InstanceRequest) -> Result<AgentInstance> {
        let mut instance = match self.lookup(req.subsystem, &req.name, &req.parent_uuid).await? {
            Lookup::NotFound => self.create(req).await?,
            Lookup::FoundSoftDeleted(instance) => self.undelete(instance).await?,
            Lookup::FoundActive(instance) => {
                tracing::info!("Reusing QAN instance {} for {}", instance.uuid, req.name);
                instance
            }
        };

        instance.dsn = req.dsn.clone();
        self.write_instance_file(&instance)?;
        Ok(instance)
    }

    async fn create(&self, req: &InstanceRequest) -> Result<AgentInstance> {
        let draft = AgentInstance {
            uuid: String::new(),
            subsystem: req.subsystem.as_str().to_string(),
            parent_uuid: req.parent_uuid.clone(),
            name: req.name.clone(),
            dsn: dsn::sanitize(&req.dsn),
            distro: req.distro.clone(),
            version: req.version.clone(),
            created_at: None,
            deleted_at: None,
        };

        let uuid = self.api.create_instance(&draft).await?;
        let created = self.api.get_instance(&uuid).await?.ok_or_else(|| AdminError::Protocol {
            subsystem: Store::QanApi,
            reason: format!("instance {} vanished right after creation", uuid),
        })?;
        tracing::info!("Created QAN instance {} for {}", created.uuid, req.name);
        Ok(created)
    }

    async fn undelete(&self, mut instance: AgentInstance) -> Result<AgentInstance> {
        let uuid = instance.uuid.clone();
        instance.deleted_at = None;
        self.api.update_instance(&instance).await?;

        // Some server versions ignore Deleted on PUT.
        let reread = self.api.get_instance(&uuid).await?;
        match reread {
            Some(instance) if !instance.is_deleted() => {
                tracing::info!("Undeleted QAN instance {}", uuid);
                Ok(instance)
            }
            _ => Err(AdminError::UndeleteNotApplied { uuid }),
        }
    }

    pub async fn soft_delete(&self, uuid: &str) -> Result<()> {
        self.api.delete_instance(uuid).await?;
        tracing::info!("Soft-deleted QAN instance {}", uuid);
        Ok(())
    }

    pub fn instance_file(&self, uuid: &str) -> PathBuf {
        self.instance_dir.join(format!("{}.json", uuid))
    }

    pub fn write_instance_file(&self, instance: &AgentInstance) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.instance_dir)?;
        let path = self.instance_file(&instance.uuid);
        let json = serde_json::to_vec_pretty(instance)?;
        write_private(&path, &json)?;
        tracing::debug!("Wrote instance file {}", path.display());
        Ok(path)
    }

    pub fn remove_instance_file(&self, uuid: &str) -> Result<()> {
        match std::fs::remove_file(self.instance_file(uuid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Relay `cmd` to the agent, polling while it has not connected yet.
    pub async fn relay(&self, agent_uuid: &str, cmd: &AgentCommand) -> Result<Vec<u8>> {
        let api = &self.api;
        self.retry
            .run(&self.cancel, |attempt| async move {
                match api.send_command(agent_uuid, cmd).await? {
                    RelayOutcome::Delivered(reply) => {
                        tracing::debug!(
                            "{} delivered to agent {} on attempt {}",
                            cmd.cmd,
                            agent_uuid,
                            attempt
                        );
                        Ok(Attempt::Ready(reply))
                    }
                    RelayOutcome::AgentNotConnected => Ok(Attempt::NotReady),
                    RelayOutcome::Rejected { status, body } => Err(AdminError::RemoteApi {
                        subsystem: Store::QanApi,
                        method: "PUT".to_string(),
                        url: format!("/agents/{}/cmd", agent_uuid),
                        status,
                        body,
                    }),
                }
            })
            .await
    }

    pub async fn start_tool(&self, agent_uuid: &str, config: &ToolConfig) -> Result<()> {
        let data = serde_json::to_vec(config)?;
        let cmd = AgentCommand::qan(self.user.clone(), CMD_START_TOOL, data);
        self.relay(agent_uuid, &cmd).await?;
        tracing::info!("Started query analytics for instance {}", config.uuid);
        Ok(())
    }

    pub async fn stop_tool(&self, agent_uuid: &str, instance_uuid: &str) -> Result<()> {
        let data = instance_uuid.as_bytes().to_vec();
        let cmd = AgentCommand::qan(self.user.clone(), CMD_STOP_TOOL, data);
        self.relay(agent_uuid, &cmd).await?;
        tracing::info!("Stopped query analytics for instance {}", instance_uuid);
        Ok(())
    }
}

fn is_same(instance: &AgentInstance, subsystem: Subsystem, name: &str, parent_uuid: &str) -> bool {
    instance.subsystem == subsystem.as_str()
        && instance.name == name
        && instance.parent_uuid == parent_uuid
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(contents)
}
