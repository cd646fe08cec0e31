use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/percona/pmm-client/pmm.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// host[:port] of the PMM server
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub insecure_ssl: bool,
    /// Client-wide timeout shared by every HTTP call
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Node name in the catalog, the hostname when unset
    #[serde(default)]
    pub name: Option<String>,
    /// Address the PMM server reaches this node on
    #[serde(default)]
    pub address: String,
    /// Address exporters listen on, `address` when unset
    #[serde(default)]
    pub bind_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_qan_base")]
    pub qan_base: PathBuf,
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
}

fn default_timeout() -> u64 {
    10
}

fn default_qan_base() -> PathBuf {
    PathBuf::from("/usr/local/percona/qan-agent")
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("/usr/local/percona/pmm-client")
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            qan_base: default_qan_base(),
            bin_dir: default_bin_dir(),
            unit_dir: default_unit_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Catalog node name, falling back to the system hostname.
    pub fn client_name(&self) -> Result<String> {
        match &self.client.name {
            Some(name) if !name.is_empty() => Ok(name.clone()),
            _ => Ok(hostname::get()
                .context("Failed to get system hostname")?
                .to_string_lossy()
                .to_string()),
        }
    }

    pub fn bind_address(&self) -> &str {
        self.client
            .bind_address
            .as_deref()
            .unwrap_or(&self.client.address)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    /// Base URL of the PMM server, scheme included.
    pub fn server_url(&self) -> String {
        let scheme = if self.server.ssl || self.server.insecure_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.server.address.trim_end_matches('/'))
    }
}
