//! Enable and disable monitoring of a target on this node.
//!
//! Every operation walks the three stores in a fixed order so that an
//! interruption leaves either a catalog record without its local service
//! (healed by `repair`) or nothing at all.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use shared::dsn;
use shared::protocol::{KV_DSN, KV_OPTS};
use shared::types::{ServiceMeta, ServiceRecord, ServiceType, Subsystem};
use crate::catalog::NodeCatalog;
use crate::error::{AdminError, Failures, Result};
use crate::guard::DuplicateGuard;
use crate::ports::PortAllocator;
use crate::qan::agent::AgentRegistration;
use crate::qan::rendezvous::{AgentRendezvous, InstanceRequest, ToolConfig};
use crate::reconcile::ReconciliationEngine;
use crate::supervisor::{LocalService, ServiceManager};

/// A metrics exporter to enable.
#[derive(Debug, Clone)]
pub struct MetricsTarget {
    /// Any type but `queries`
    pub service_type: ServiceType,
    pub alias: String,
    /// 0 picks the first free port from the type's default
    pub port: u16,
    pub dsn: Option<String>,
    pub meta: ServiceMeta,
    /// Extra exporter flags, stored under `opts/` and passed as `-<name>=<value>`
    pub options: BTreeMap<String, String>,
}

/// A query-analytics instance to enable.
#[derive(Debug, Clone)]
pub struct QueriesTarget {
    pub subsystem: Subsystem,
    pub alias: String,
    pub dsn: String,
    /// Tags added to the shared `queries` record
    pub meta: ServiceMeta,
    /// MySQL only: "slowlog" or "perfschema"
    pub query_source: Option<String>,
    pub distro: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub record: ServiceRecord,
    pub local_name: String,
    pub running: bool,
}

/// Where local binaries live and what exporters bind to.
#[derive(Debug, Clone)]
pub struct LocalLayout {
    pub bin_dir: PathBuf,
    pub qan_base: PathBuf,
    pub bind_address: String,
}

pub struct Admin {
    node: NodeCatalog,
    guard: DuplicateGuard,
    ports: PortAllocator,
    supervisor: Arc<dyn ServiceManager>,
    rendezvous: Arc<AgentRendezvous>,
    registration: Arc<AgentRegistration>,
    layout: LocalLayout,
}

impl Admin {
    pub fn new(
        node: NodeCatalog,
        supervisor: Arc<dyn ServiceManager>,
        rendezvous: Arc<AgentRendezvous>,
        registration: Arc<AgentRegistration>,
        layout: LocalLayout,
    ) -> Self {
        Self {
            guard: DuplicateGuard::new(node.clone()),
            ports: PortAllocator::new(node.clone()),
            node,
            supervisor,
            rendezvous,
            registration,
            layout,
        }
    }

    pub fn reconciliation(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            self.node.clone(),
            self.supervisor.clone(),
            self.rendezvous.clone(),
        )
    }

    pub async fn add_metrics(&self, target: MetricsTarget) -> Result<ServiceRecord> {
        let service_type = target.service_type;
        let alias = target.alias.as_str();

        if self.node.find(service_type, alias).await?.is_some() {
            return Err(AdminError::DuplicateService {
                service_type: service_type.to_string(),
                alias: alias.to_string(),
            });
        }
        self.guard.check_global_uniqueness(service_type, alias).await?;
        let port = self.ports.choose(target.port, service_type.default_port()).await?;

        let mut meta = target.meta.clone();
        meta.aliases.clear();
        meta.aliases.insert(alias.to_string());
        let record = ServiceRecord::new(
            service_type,
            port,
            meta,
            self.node.node_name.clone(),
            self.node.node_address.clone(),
        );
        self.node.catalog.register_service(&record).await?;
        tracing::info!("Registered {} for {} on port {}", record.id, alias, port);

        let prefix = record.kv_prefix();
        if let Some(raw) = &target.dsn {
            self.node
                .kv_put_str(&format!("{}{}", prefix, KV_DSN), &dsn::sanitize(raw))
                .await?;
        }
        for (name, value) in &target.options {
            self.node
                .kv_put_str(&format!("{}{}/{}", prefix, KV_OPTS, name), value)
                .await?;
        }

        let service = self.exporter_service(&record, &target);
        self.supervisor.install(&service).await?;
        self.supervisor.start(&service.name).await?;
        tracing::info!("Started {}", service.name);
        Ok(record)
    }

    pub async fn add_queries(&self, target: QueriesTarget) -> Result<ServiceRecord> {
        let alias = target.alias.as_str();
        let existing = self.node.find_type(ServiceType::Queries).await?;

        if existing.as_ref().is_some_and(|r| r.meta.has_alias(alias)) {
            return Err(AdminError::DuplicateService {
                service_type: target.subsystem.product().to_string(),
                alias: alias.to_string(),
            });
        }
        self.guard
            .check_global_uniqueness(ServiceType::Queries, alias)
            .await?;

        let identity = self.registration.ensure().await?;
        let instance = self
            .rendezvous
            .find_or_create(&InstanceRequest {
                subsystem: target.subsystem,
                name: alias.to_string(),
                parent_uuid: identity.os_uuid.clone(),
                dsn: target.dsn.clone(),
                distro: target.distro.clone(),
                version: target.version.clone(),
            })
            .await?;

        let mut record = match existing {
            Some(record) => record,
            None => {
                let port = self
                    .ports
                    .choose(0, ServiceType::Queries.default_port())
                    .await?;
                ServiceRecord::new(
                    ServiceType::Queries,
                    port,
                    ServiceMeta::default(),
                    self.node.node_name.clone(),
                    self.node.node_address.clone(),
                )
            }
        };

        // KV before the alias tag: a registered alias always names its instance.
        let alias_prefix = format!("{}{}/", record.kv_prefix(), alias);
        self.node
            .kv_put_str(&format!("{}{}", alias_prefix, target.subsystem.uuid_key()), &instance.uuid)
            .await?;
        self.node
            .kv_put_str(&format!("{}{}", alias_prefix, KV_DSN), &dsn::sanitize(&target.dsn))
            .await?;

        merge_meta(&mut record.meta, &target.meta);
        record.meta.aliases.insert(alias.to_string());
        self.node.catalog.register_service(&record).await?;
        tracing::info!("Registered {} alias {} (instance {})", record.id, alias, instance.uuid);

        let config = ToolConfig::new(
            target.subsystem,
            instance.uuid.clone(),
            target.query_source.as_deref(),
        );
        if let Err(e) = self.start_queries(&record, &identity.agent_uuid, &config).await {
            // Take the alias back out of every store.
            tracing::warn!("Query analytics for {} did not start; rolling back: {}", alias, e);
            if let Err(undo) = self.drop_alias(record, alias, Some(&instance.uuid)).await {
                tracing::warn!(
                    "Rollback of {} incomplete; remove it with `pmm-admin remove`: {}",
                    alias,
                    undo
                );
            }
            return Err(e);
        }
        Ok(record)
    }

    /// Make sure the shared agent service runs, then hand it the instance.
    async fn start_queries(
        &self,
        record: &ServiceRecord,
        agent_uuid: &str,
        config: &ToolConfig,
    ) -> Result<()> {
        let agent = self.agent_service(record);
        if !self.supervisor.list().await?.contains(&agent.name) {
            self.supervisor.install(&agent).await?;
        }
        if !self.supervisor.is_running(&agent.name).await? {
            self.supervisor.start(&agent.name).await?;
        }
        self.rendezvous.start_tool(agent_uuid, config).await
    }

    pub async fn remove_metrics(&self, service_type: ServiceType, alias: &str) -> Result<()> {
        let record = self
            .node
            .find(service_type, alias)
            .await?
            .ok_or_else(|| AdminError::NoService {
                service_type: service_type.to_string(),
                alias: alias.to_string(),
            })?;
        self.remove_record(&record).await
    }

    pub async fn remove_queries(&self, subsystem: Subsystem, alias: &str) -> Result<()> {
        let no_service = || AdminError::NoService {
            service_type: subsystem.product().to_string(),
            alias: alias.to_string(),
        };
        let record = self
            .node
            .find(ServiceType::Queries, alias)
            .await?
            .ok_or_else(no_service)?;

        let instance = self.alias_instance(&record, alias).await?;
        let uuid = match instance {
            Some((owner, _)) if owner != subsystem => return Err(no_service()),
            Some((_, uuid)) => {
                self.stop_instance(&record, &uuid).await?;
                Some(uuid)
            }
            None => None,
        };
        self.drop_alias(record, alias, uuid.as_deref()).await
    }

    /// Soft-delete the alias's instance, drop its KV keys and its tag. The
    /// record and the agent service go with the last alias.
    async fn drop_alias(
        &self,
        mut record: ServiceRecord,
        alias: &str,
        instance_uuid: Option<&str>,
    ) -> Result<()> {
        if let Some(uuid) = instance_uuid {
            self.rendezvous.soft_delete(uuid).await?;
            self.rendezvous.remove_instance_file(uuid)?;
        }

        self.node
            .catalog
            .kv_delete_tree(&format!("{}{}/", record.kv_prefix(), alias))
            .await?;

        record.meta.aliases.remove(alias);
        if record.meta.aliases.is_empty() {
            return self.remove_record(&record).await;
        }
        self.node.catalog.register_service(&record).await?;
        tracing::info!("Removed alias {} from {}", alias, record.id);
        Ok(())
    }

    /// Remove every service and alias of this node. Returns what was removed.
    pub async fn remove_all(&self, ignore_errors: bool) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut failures = Failures::default();

        for record in self.node.services().await? {
            if record.service_type != ServiceType::Queries {
                let item = record.id.clone();
                let result = self.remove_record(&record).await;
                if result.is_ok() {
                    removed.push(item.clone());
                }
                failures.record(&item, result, ignore_errors)?;
                continue;
            }

            for alias in &record.meta.aliases {
                let item = format!("{} {}", record.id, alias);
                let result = match self.alias_instance(&record, alias).await {
                    Ok(instance) => {
                        let subsystem = instance.map(|(s, _)| s).unwrap_or(Subsystem::Mysql);
                        self.remove_queries(subsystem, alias).await
                    }
                    Err(e) => Err(e),
                };
                if result.is_ok() {
                    removed.push(item.clone());
                }
                failures.record(&item, result, ignore_errors)?;
            }
        }

        failures.into_result()?;
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<ServiceStatus>> {
        let mut records = self.node.services().await?;
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let local_name = record.local_name();
            let running = self.supervisor.is_running(&local_name).await?;
            statuses.push(ServiceStatus {
                record,
                local_name,
                running,
            });
        }
        Ok(statuses)
    }

    /// QAN API version of the PMM server.
    pub async fn ping(&self) -> Result<String> {
        self.rendezvous.api().ping().await
    }

    /// Local service first, catalog record last, so a failure in between
    /// shows up in the next `repair`.
    async fn remove_record(&self, record: &ServiceRecord) -> Result<()> {
        let local_name = record.local_name();
        self.supervisor.uninstall(&local_name).await?;
        self.node.catalog.kv_delete_tree(&record.kv_prefix()).await?;
        self.node
            .catalog
            .deregister_service(&self.node.node_name, &record.id)
            .await?;
        tracing::info!("Removed {} ({})", record.id, local_name);
        Ok(())
    }

    /// Subsystem and instance UUID stored for `alias` of a queries record.
    async fn alias_instance(
        &self,
        record: &ServiceRecord,
        alias: &str,
    ) -> Result<Option<(Subsystem, String)>> {
        let alias_prefix = format!("{}{}/", record.kv_prefix(), alias);
        let entries = self.node.catalog.kv_list(&alias_prefix).await?;

        Ok(entries.iter().find_map(|entry| {
            let subsystem = Subsystem::from_uuid_key(entry.key.strip_prefix(&alias_prefix)?)?;
            let uuid = String::from_utf8_lossy(&entry.value).trim().to_string();
            (!uuid.is_empty()).then_some((subsystem, uuid))
        }))
    }

    /// StopTool through a running local agent. Without one there is nothing to stop.
    async fn stop_instance(&self, record: &ServiceRecord, uuid: &str) -> Result<()> {
        let Some(config) = self.registration.read_config()? else {
            tracing::warn!("No local QAN agent config; not sending StopTool for {}", uuid);
            return Ok(());
        };
        if !self.supervisor.is_running(&record.local_name()).await? {
            tracing::warn!(
                "{} is not running; not sending StopTool for {}",
                record.local_name(),
                uuid
            );
            return Ok(());
        }
        self.rendezvous.stop_tool(&config.agent_uuid, uuid).await
    }

    fn exporter_service(&self, record: &ServiceRecord, target: &MetricsTarget) -> LocalService {
        let executable = record.service_type.executable();
        let listen = format!("{}:{}", self.layout.bind_address, record.port);
        let mut args = vec![format!("-web.listen-address={}", listen)];
        args.extend(target.options.iter().map(|(k, v)| format!("-{}={}", k, v)));

        let env = match (record.service_type, &target.dsn) {
            (ServiceType::MongodbMetrics, Some(raw)) => {
                vec![("MONGODB_URI".to_string(), raw.clone())]
            }
            (ServiceType::MysqlMetrics | ServiceType::ProxysqlMetrics, Some(raw)) => {
                vec![("DATA_SOURCE_NAME".to_string(), raw.clone())]
            }
            _ => Vec::new(),
        };

        LocalService {
            name: record.local_name(),
            description: format!("PMM Prometheus {} {}", executable, record.port),
            executable: self.layout.bin_dir.join(executable),
            args,
            env,
        }
    }

    fn agent_service(&self, record: &ServiceRecord) -> LocalService {
        LocalService {
            name: record.local_name(),
            description: "PMM Query Analytics agent".to_string(),
            executable: self
                .layout
                .qan_base
                .join("bin")
                .join(ServiceType::Queries.executable()),
            args: vec![
                "-basedir".to_string(),
                self.layout.qan_base.display().to_string(),
            ],
            env: Vec::new(),
        }
    }
}

/// Fill unset fields of `meta` from `extra`; existing values win.
fn merge_meta(meta: &mut ServiceMeta, extra: &ServiceMeta) {
    for (field, value) in [
        (&mut meta.node_type, &extra.node_type),
        (&mut meta.replset, &extra.replset),
        (&mut meta.cluster, &extra.cluster),
        (&mut meta.scheme, &extra.scheme),
    ] {
        if field.is_none() {
            *field = value.clone();
        }
    }
}
