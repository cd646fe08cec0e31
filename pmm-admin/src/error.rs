use std::fmt;
use shared::types::ServiceType;

/// The three stores pmm-admin keeps converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Catalog,
    QanApi,
    Supervisor,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subsystem::Catalog => "catalog (Consul)",
            Subsystem::QanApi => "QAN API",
            Subsystem::Supervisor => "local service supervisor",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(
        "there is already a {service_type} service with alias '{alias}' on this node; \
         remove it first with `pmm-admin remove`"
    )]
    DuplicateService { service_type: String, alias: String },

    #[error("no {service_type} service with alias '{alias}' on this node; see `pmm-admin list`")]
    NoService { service_type: String, alias: String },

    #[error(
        "node name '{node}' is already registered in the catalog with address {address} \
         and has services; set a different client name in the config or remove the services \
         of that node first"
    )]
    NodeIdentityConflict { node: String, address: String },

    #[error(
        "{service_type} alias '{alias}' is already used by node '{node}' ({address}); \
         choose another alias"
    )]
    AliasConflict {
        service_type: ServiceType,
        alias: String,
        node: String,
        address: String,
    },

    #[error(
        "port {port} is already used by service {service_id} on this node; \
         pass a different --port or omit it"
    )]
    PortInUse { port: u16, service_id: String },

    #[error("no free port in range {first}-{last}; pass --port explicitly")]
    PortRangeExhausted { first: u16, last: u16 },

    #[error(
        "QAN agent did not connect to the QAN API after {attempts} attempts; \
         check that the agent service runs and see its log"
    )]
    AgentRendezvousTimeout { attempts: u32 },

    #[error(
        "QAN API did not clear the deleted flag of instance {uuid}; \
         upgrade the PMM server or re-add under another alias"
    )]
    UndeleteNotApplied { uuid: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{subsystem} error: {method} {url} returned {status}: {body}")]
    RemoteApi {
        subsystem: Subsystem,
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("{subsystem} request failed: {method} {url}: {reason}")]
    Transport {
        subsystem: Subsystem,
        method: String,
        url: String,
        reason: String,
    },

    #[error("{subsystem} returned an unexpected response: {reason}")]
    Protocol { subsystem: Subsystem, reason: String },

    #[error(
        "local service supervisor failed on {service}: {reason}; \
         run `pmm-admin repair` to converge state"
    )]
    Supervisor { service: String, reason: String },

    #[error("QAN agent registration failed: {reason}")]
    AgentRegistration { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{} of {total} operations failed:\n{}", .failures.len(), .failures.join("\n"))]
    Batch { total: usize, failures: Vec<String> },
}

impl AdminError {
    /// Which store the error came from, if any.
    pub fn subsystem(&self) -> Option<Subsystem> {
        match self {
            AdminError::RemoteApi { subsystem, .. }
            | AdminError::Transport { subsystem, .. }
            | AdminError::Protocol { subsystem, .. } => Some(*subsystem),
            AdminError::Supervisor { .. } => Some(Subsystem::Supervisor),
            AdminError::NodeIdentityConflict { .. }
            | AdminError::AliasConflict { .. }
            | AdminError::PortInUse { .. }
            | AdminError::PortRangeExhausted { .. } => Some(Subsystem::Catalog),
            AdminError::AgentRendezvousTimeout { .. } | AdminError::UndeleteNotApplied { .. } => {
                Some(Subsystem::QanApi)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdminError>;

/// Collects per-item failures of a best-effort batch.
#[derive(Debug, Default)]
pub struct Failures {
    total: usize,
    failures: Vec<String>,
}

impl Failures {
    /// Record the outcome of one item. With `ignore_errors` unset the first
    /// failure is returned immediately.
    pub fn record(&mut self, item: &str, result: Result<()>, ignore_errors: bool) -> Result<()> {
        self.total += 1;
        match result {
            Ok(()) => Ok(()),
            Err(e) if ignore_errors => {
                tracing::warn!("{}: {}", item, e);
                self.failures.push(format!("{}: {}", item, e));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The recorded failure messages, one per failed item.
    pub fn into_messages(self) -> Vec<String> {
        self.failures
    }

    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(AdminError::Batch {
                total: self.total,
                failures: self.failures,
            })
        }
    }
}
