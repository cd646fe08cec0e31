//! Local OS service supervisor boundary.
//!
//! The core only relies on the `pmm-<type>-<port>` naming convention; the
//! systemd backend below is a thin pass-through.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use shared::protocol::LOCAL_SERVICE_PREFIX;
use crate::error::{AdminError, Result};

/// A process to run under the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalService {
    pub name: String,
    pub description: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Installed services whose name starts with `pmm-`.
    async fn list(&self) -> Result<Vec<String>>;

    async fn install(&self, service: &LocalService) -> Result<()>;

    /// Stop and remove. Removing a missing service is not an error.
    async fn uninstall(&self, name: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;
}

/// systemd unit files under `unit_dir`, driven through `systemctl`.
pub struct SystemdManager {
    unit_dir: PathBuf,
}

impl SystemdManager {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", name))
    }

    fn unit_file(service: &LocalService) -> String {
        let mut exec = service.executable.display().to_string();
        for arg in &service.args {
            exec.push(' ');
            exec.push_str(arg);
        }

        let mut unit = format!(
            "[Unit]\nDescription={}\nAfter=network.target\n\n\
             [Service]\nType=simple\nExecStart={}\nRestart=always\nRestartSec=5\n",
            service.description, exec
        );
        for (key, value) in &service.env {
            unit.push_str(&format!("Environment=\"{}={}\"\n", key, value));
        }
        unit.push_str("\n[Install]\nWantedBy=multi-user.target\n");
        unit
    }

    async fn systemctl(&self, args: &[&str], service: &str) -> Result<std::process::Output> {
        tokio::process::Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| AdminError::Supervisor {
                service: service.to_string(),
                reason: format!("cannot run systemctl: {}", e),
            })
    }

    async fn systemctl_ok(&self, args: &[&str], service: &str) -> Result<()> {
        let output = self.systemctl(args, service).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(AdminError::Supervisor {
            service: service.to_string(),
            reason: format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.unit_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(name) = file_name.strip_suffix(".service") {
                if name.starts_with(LOCAL_SERVICE_PREFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn install(&self, service: &LocalService) -> Result<()> {
        let path = self.unit_path(&service.name);
        write_unit(&path, &Self::unit_file(service)).await?;
        self.systemctl_ok(&["daemon-reload"], &service.name).await?;
        self.systemctl_ok(&["enable", &service.name], &service.name).await?;
        tracing::info!("Installed {}", service.name);
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<()> {
        let path = self.unit_path(name);
        if !path.exists() {
            return Ok(());
        }
        // A unit that is not running fails to stop; that is fine here.
        let _ = self.systemctl(&["stop", name], name).await?;
        let _ = self.systemctl(&["disable", name], name).await?;
        tokio::fs::remove_file(&path).await?;
        self.systemctl_ok(&["daemon-reload"], name).await?;
        tracing::info!("Uninstalled {}", name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.systemctl_ok(&["start", name], name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.systemctl_ok(&["stop", name], name).await
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let output = self.systemctl(&["is-active", "--quiet", name], name).await?;
        Ok(output.status.success())
    }
}

/// Write a unit file readable by its owner only; the mode is in place
/// before any content is written.
async fn write_unit(path: &Path, contents: &str) -> Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut file = opts.open(path).await?;
    #[cfg(unix)]
    {
        // An existing file keeps its old mode on open.
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
pub mod fake {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use super::*;

    #[derive(Default)]
    struct Inner {
        services: BTreeMap<String, (LocalService, bool)>,
        fail_once: HashSet<String>,
    }

    /// In-memory supervisor. `fail_next("uninstall:pmm-x")` makes that call fail once.
    #[derive(Default)]
    pub struct FakeSupervisor {
        inner: Mutex<Inner>,
    }

    impl FakeSupervisor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_bare(&self, name: &str) {
            let service = LocalService {
                name: name.to_string(),
                description: String::new(),
                executable: PathBuf::from("/bin/true"),
                args: Vec::new(),
                env: Vec::new(),
            };
            self.inner
                .lock()
                .unwrap()
                .services
                .insert(name.to_string(), (service, true));
        }

        pub fn remove_bare(&self, name: &str) {
            self.inner.lock().unwrap().services.remove(name);
        }

        pub fn get(&self, name: &str) -> Option<LocalService> {
            self.inner.lock().unwrap().services.get(name).map(|(s, _)| s.clone())
        }

        pub fn names(&self) -> Vec<String> {
            self.inner.lock().unwrap().services.keys().cloned().collect()
        }

        pub fn fail_next(&self, op_and_name: &str) {
            self.inner.lock().unwrap().fail_once.insert(op_and_name.to_string());
        }

        fn check(inner: &mut Inner, op: &str, name: &str) -> Result<()> {
            if inner.fail_once.remove(&format!("{}:{}", op, name)) {
                return Err(AdminError::Supervisor {
                    service: name.to_string(),
                    reason: format!("injected {} failure", op),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ServiceManager for FakeSupervisor {
        async fn list(&self) -> Result<Vec<String>> {
            Ok(self
                .names()
                .into_iter()
                .filter(|n| n.starts_with(LOCAL_SERVICE_PREFIX))
                .collect())
        }

        async fn install(&self, service: &LocalService) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            Self::check(&mut inner, "install", &service.name)?;
            inner
                .services
                .insert(service.name.clone(), (service.clone(), false));
            Ok(())
        }

        async fn uninstall(&self, name: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            Self::check(&mut inner, "uninstall", name)?;
            inner.services.remove(name);
            Ok(())
        }

        async fn start(&self, name: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            Self::check(&mut inner, "start", name)?;
            match inner.services.get_mut(name) {
                Some(entry) => {
                    entry.1 = true;
                    Ok(())
                }
                None => Err(AdminError::Supervisor {
                    service: name.to_string(),
                    reason: "not installed".to_string(),
                }),
            }
        }

        async fn stop(&self, name: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            Self::check(&mut inner, "stop", name)?;
            if let Some(entry) = inner.services.get_mut(name) {
                entry.1 = false;
            }
            Ok(())
        }

        async fn is_running(&self, name: &str) -> Result<bool> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .services
                .get(name)
                .map(|(_, running)| *running)
                .unwrap_or(false))
        }
    }
}
