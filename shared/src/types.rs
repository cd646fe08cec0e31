use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol;

/// Catalog service types managed by pmm-admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceType {
    #[serde(rename = "linux:metrics")]
    LinuxMetrics,
    #[serde(rename = "mysql:metrics")]
    MysqlMetrics,
    #[serde(rename = "mongodb:metrics")]
    MongodbMetrics,
    #[serde(rename = "proxysql:metrics")]
    ProxysqlMetrics,
    /// The shared query-analytics agent. One per node, hosting many aliases.
    #[serde(rename = "queries")]
    Queries,
}

impl ServiceType {
    pub const ALL: [ServiceType; 5] = [
        ServiceType::LinuxMetrics,
        ServiceType::Queries,
        ServiceType::MysqlMetrics,
        ServiceType::MongodbMetrics,
        ServiceType::ProxysqlMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::LinuxMetrics => "linux:metrics",
            ServiceType::MysqlMetrics => "mysql:metrics",
            ServiceType::MongodbMetrics => "mongodb:metrics",
            ServiceType::ProxysqlMetrics => "proxysql:metrics",
            ServiceType::Queries => "queries",
        }
    }

    /// First port probed when the user does not ask for one.
    pub fn default_port(&self) -> u16 {
        match self {
            ServiceType::LinuxMetrics => 42000,
            ServiceType::Queries => 42001,
            ServiceType::MysqlMetrics => 42002,
            ServiceType::MongodbMetrics => 42003,
            ServiceType::ProxysqlMetrics => 42004,
        }
    }

    /// Exporter binary run by the local service.
    pub fn executable(&self) -> &'static str {
        match self {
            ServiceType::LinuxMetrics => "node_exporter",
            ServiceType::MysqlMetrics => "mysqld_exporter",
            ServiceType::MongodbMetrics => "mongodb_exporter",
            ServiceType::ProxysqlMetrics => "proxysql_exporter",
            ServiceType::Queries => "percona-qan-agent",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown service type: {}", s))
    }
}

/// QAN subsystem an instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Mysql,
    Mongo,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Mysql => "mysql",
            Subsystem::Mongo => "mongo",
        }
    }

    /// User-facing product name, e.g. "mysql:queries".
    pub fn product(&self) -> &'static str {
        match self {
            Subsystem::Mysql => "mysql:queries",
            Subsystem::Mongo => "mongodb:queries",
        }
    }

    /// KV key holding the instance UUID for an alias of this subsystem.
    pub fn uuid_key(&self) -> String {
        format!("qan_{}_uuid", self.as_str())
    }

    /// Inverse of [`Subsystem::uuid_key`].
    pub fn from_uuid_key(key: &str) -> Option<Subsystem> {
        [Subsystem::Mysql, Subsystem::Mongo]
            .into_iter()
            .find(|s| key == s.uuid_key())
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured form of the catalog tag list.
///
/// Only the catalog client knows the flat `alias_`/`nodetype_`/... encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMeta {
    /// Aliases hosted by the service. Metrics services carry exactly one.
    pub aliases: BTreeSet<String>,

    pub node_type: Option<String>,

    /// MongoDB replica set name
    pub replset: Option<String>,

    pub cluster: Option<String>,

    /// Exporter scrape scheme, "http" or "https"
    pub scheme: Option<String>,

    /// Tags written by something other than pmm-admin, kept verbatim
    pub extra_tags: Vec<String>,
}

impl ServiceMeta {
    pub fn with_alias(alias: impl Into<String>) -> Self {
        let mut meta = Self::default();
        meta.aliases.insert(alias.into());
        meta
    }

    /// The primary alias, for single-alias services.
    pub fn alias(&self) -> Option<&str> {
        self.aliases.iter().next().map(String::as_str)
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.aliases.contains(alias)
    }
}

/// A service registered in the catalog for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique per node, `<service_type>-<port>`
    pub id: String,

    pub service_type: ServiceType,

    pub meta: ServiceMeta,

    pub port: u16,

    /// Logical node name the record is registered under
    pub node_name: String,

    /// Address of that node as seen by the catalog
    pub node_address: String,
}

impl ServiceRecord {
    pub fn new(
        service_type: ServiceType,
        port: u16,
        meta: ServiceMeta,
        node_name: impl Into<String>,
        node_address: impl Into<String>,
    ) -> Self {
        Self {
            id: service_id(service_type, port),
            service_type,
            meta,
            port,
            node_name: node_name.into(),
            node_address: node_address.into(),
        }
    }

    /// Name of the local supervised process bound to this record.
    pub fn local_name(&self) -> String {
        local_service_name(self.service_type.as_str(), self.port)
    }

    /// KV prefix owning every key of this record, trailing slash included.
    pub fn kv_prefix(&self) -> String {
        format!("{}/{}/", self.node_name, self.id)
    }
}

pub fn service_id(service_type: ServiceType, port: u16) -> String {
    format!("{}-{}", service_type.as_str(), port)
}

/// `pmm-<type with ':' replaced by '-'>-<port>`. This name is the only link
/// between a catalog record and the local process.
pub fn local_service_name(service_type: &str, port: u16) -> String {
    format!(
        "{}{}-{}",
        protocol::LOCAL_SERVICE_PREFIX,
        service_type.replace(':', "-"),
        port
    )
}

/// A QAN instance record owned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentInstance {
    #[serde(rename = "UUID", default)]
    pub uuid: String,

    pub subsystem: String,

    #[serde(rename = "ParentUUID", default)]
    pub parent_uuid: String,

    pub name: String,

    /// Sanitized everywhere except the local instance file
    #[serde(rename = "DSN", default)]
    pub dsn: String,

    #[serde(default)]
    pub distro: String,

    #[serde(default)]
    pub version: String,

    #[serde(rename = "Created", default, with = "go_time")]
    pub created_at: Option<DateTime<Utc>>,

    /// None while the instance is active
    #[serde(rename = "Deleted", default, with = "go_time")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// The QAN API speaks Go's `time.Time`, where the zero value
/// `0001-01-01T00:00:00Z` stands for "unset".
pub mod go_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const ZERO: &str = "0001-01-01T00:00:00Z";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&t.to_rfc3339()),
            None => s.serialize_str(ZERO),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(s) if s.is_empty() || s.starts_with("0001-01-01") => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}
