//! One-time registration of the local QAN agent.
//!
//! Registration runs an external installer that creates the agent's identity
//! under the QAN base directory. A half-finished earlier run can leave
//! config/data/instance directories behind, so every attempt starts from a
//! clean slate and a failed attempt is retried once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::{AdminError, Result};
use crate::qan::QanApi;

const STATE_DIRS: [&str; 3] = ["config", "data", "instance"];
const INSTALL_ATTEMPTS: u32 = 2;

/// `config/agent.conf` as written by the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(rename = "UUID")]
    pub agent_uuid: String,
    #[serde(rename = "ApiHostname", default)]
    pub api_hostname: String,
}

/// Who the local agent is on the QAN API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_uuid: String,
    /// OS instance the agent belongs to; parent of every database instance
    pub os_uuid: String,
}

#[async_trait]
pub trait AgentInstaller: Send + Sync {
    /// Register a new agent, writing its state under `base`.
    async fn install(&self, base: &Path) -> Result<()>;
}

/// Runs `percona-qan-agent-installer`.
pub struct InstallerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl InstallerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentInstaller for InstallerCommand {
    async fn install(&self, base: &Path) -> Result<()> {
        tracing::info!("Running {}", self.program.display());
        let output = tokio::process::Command::new(&self.program)
            .arg("-basedir")
            .arg(base)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| AdminError::AgentRegistration {
                reason: format!("cannot run {}: {}", self.program.display(), e),
            })?;

        if !output.status.success() {
            return Err(AdminError::AgentRegistration {
                reason: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

pub struct AgentRegistration {
    base: PathBuf,
    installer: Arc<dyn AgentInstaller>,
    api: Arc<dyn QanApi>,
}

impl AgentRegistration {
    pub fn new(
        base: impl Into<PathBuf>,
        installer: Arc<dyn AgentInstaller>,
        api: Arc<dyn QanApi>,
    ) -> Self {
        Self {
            base: base.into(),
            installer,
            api,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config").join("agent.conf")
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.base.join("instance")
    }

    pub fn read_config(&self) -> Result<Option<AgentConfig>> {
        let path = self.config_path();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<AgentConfig>(&bytes) {
            Ok(config) if !config.agent_uuid.is_empty() => Ok(Some(config)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Remove leftover agent state so the installer starts clean.
    pub fn reset_state(&self) -> Result<()> {
        for dir in STATE_DIRS {
            let path = self.base.join(dir);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Return the agent identity, registering a new agent when there is
    /// none or the server no longer knows the local one.
    pub async fn ensure(&self) -> Result<AgentIdentity> {
        if let Some(config) = self.read_config()? {
            if let Some(identity) = self.resolve(&config).await? {
                return Ok(identity);
            }
            tracing::warn!(
                "QAN API does not know agent {}; registering a new agent",
                config.agent_uuid
            );
        }

        for attempt in 1..=INSTALL_ATTEMPTS {
            self.reset_state()?;
            match self.installer.install(&self.base).await {
                Ok(()) => break,
                Err(e) if attempt < INSTALL_ATTEMPTS => {
                    tracing::warn!("Agent registration attempt {} failed: {}", attempt, e);
                }
                Err(e) => return Err(e),
            }
        }

        let config = self.read_config()?.ok_or_else(|| AdminError::AgentRegistration {
            reason: format!("installer did not write {}", self.config_path().display()),
        })?;
        self.resolve(&config)
            .await?
            .ok_or_else(|| AdminError::AgentRegistration {
                reason: format!(
                    "agent {} is not known to the QAN API after registration",
                    config.agent_uuid
                ),
            })
    }

    async fn resolve(&self, config: &AgentConfig) -> Result<Option<AgentIdentity>> {
        let Some(agent) = self.api.get_instance(&config.agent_uuid).await? else {
            return Ok(None);
        };
        if agent.is_deleted() {
            return Ok(None);
        }
        Ok(Some(AgentIdentity {
            agent_uuid: agent.uuid,
            os_uuid: agent.parent_uuid,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qan::fake::{FakeInstaller, FakeQan};

    fn setup(fail_first: u32) -> (tempfile::TempDir, Arc<FakeInstaller>, AgentRegistration) {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeQan::new());
        let installer = Arc::new(FakeInstaller::new(api.clone(), fail_first));
        let registration = AgentRegistration::new(dir.path(), installer.clone(), api);
        (dir, installer, registration)
    }

    #[tokio::test]
    async fn test_registers_once_and_reuses() {
        let (_dir, installer, registration) = setup(0);

        let first = registration.ensure().await.unwrap();
        assert_eq!(first.agent_uuid, "agent-1");
        assert_eq!(first.os_uuid, "os-1");

        let second = registration.ensure().await.unwrap();
        assert_eq!(second, first);
        assert_eq!(installer.runs(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_is_retried_from_clean_state() {
        let (dir, installer, registration) = setup(1);

        let identity = registration.ensure().await.unwrap();
        assert_eq!(identity.agent_uuid, "agent-2");
        assert_eq!(installer.runs(), 2);

        // Leftovers of the failed run were wiped before the retry.
        assert!(!dir.path().join("data").join("run-1").exists());
        assert!(dir.path().join("data").join("run-2").exists());
    }

    #[tokio::test]
    async fn test_gives_up_after_second_failure() {
        let (_dir, installer, registration) = setup(5);
        let err = registration.ensure().await.unwrap_err();
        assert!(matches!(err, AdminError::AgentRegistration { .. }));
        assert_eq!(installer.runs(), 2);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_registered_again() {
        let (dir, installer, registration) = setup(0);
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(
            registration.config_path(),
            br#"{"UUID":"stale-agent","ApiHostname":"old"}"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("instance")).unwrap();
        std::fs::write(dir.path().join("instance").join("old.json"), b"{}").unwrap();

        let identity = registration.ensure().await.unwrap();
        assert_eq!(identity.agent_uuid, "agent-1");
        assert_eq!(installer.runs(), 1);
        assert!(!dir.path().join("instance").join("old.json").exists());
    }
}
