//! Detects and heals divergence between local supervisor entries and the
//! catalog records of this node.
//!
//! A record is tied to its local process only by `pmm-<type>-<port>`, so the
//! diff is a plain set difference on that name.

use std::collections::BTreeSet;
use std::sync::Arc;
use shared::types::{ServiceRecord, Subsystem};
use crate::catalog::NodeCatalog;
use crate::error::{Failures, Result};
use crate::qan::rendezvous::AgentRendezvous;
use crate::supervisor::ServiceManager;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Local services the catalog knows nothing about
    pub orphaned_local: Vec<String>,
    /// Catalog records without a local service
    pub missing_remote: Vec<ServiceRecord>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.orphaned_local.is_empty() && self.missing_remote.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub uninstalled: Vec<String>,
    pub deregistered: Vec<String>,
    pub soft_deleted: Vec<String>,
    /// Items that could not be healed, with the reason
    pub failed: Vec<String>,
}

impl RepairReport {
    pub fn is_empty(&self) -> bool {
        self.uninstalled.is_empty()
            && self.deregistered.is_empty()
            && self.soft_deleted.is_empty()
            && self.failed.is_empty()
    }
}

pub struct ReconciliationEngine {
    node: NodeCatalog,
    supervisor: Arc<dyn ServiceManager>,
    rendezvous: Arc<AgentRendezvous>,
}

impl ReconciliationEngine {
    pub fn new(
        node: NodeCatalog,
        supervisor: Arc<dyn ServiceManager>,
        rendezvous: Arc<AgentRendezvous>,
    ) -> Self {
        Self {
            node,
            supervisor,
            rendezvous,
        }
    }

    pub async fn diff(&self) -> Result<Diff> {
        let local: BTreeSet<String> = self.supervisor.list().await?.into_iter().collect();
        let mut remote = self.node.services().await?;
        remote.sort_by(|a, b| a.id.cmp(&b.id));

        let expected: BTreeSet<String> = remote.iter().map(ServiceRecord::local_name).collect();

        Ok(Diff {
            orphaned_local: local.difference(&expected).cloned().collect(),
            missing_remote: remote
                .into_iter()
                .filter(|r| !local.contains(&r.local_name()))
                .collect(),
        })
    }

    /// Uninstall orphaned local services and purge records that lost their
    /// local service. With `ignore_errors` every item is attempted and the
    /// failures land in `RepairReport::failed` next to what did heal.
    pub async fn repair(&self, ignore_errors: bool) -> Result<RepairReport> {
        let diff = self.diff().await?;
        let mut report = RepairReport::default();
        let mut failures = Failures::default();

        if diff.is_empty() {
            tracing::info!("Nothing to repair on node {}", self.node.node_name);
            return Ok(report);
        }

        for name in &diff.orphaned_local {
            tracing::info!("Uninstalling orphaned local service {}", name);
            let result = self.supervisor.uninstall(name).await;
            if result.is_ok() {
                report.uninstalled.push(name.clone());
            }
            failures.record(name, result, ignore_errors)?;
        }

        for record in &diff.missing_remote {
            tracing::info!(
                "Removing {} from the catalog: no local service {}",
                record.id,
                record.local_name()
            );
            let result = self.purge(record, &mut report).await;
            if result.is_ok() {
                report.deregistered.push(record.id.clone());
            }
            failures.record(&record.id, result, ignore_errors)?;
        }

        report.failed = failures.into_messages();
        Ok(report)
    }

    /// Remove a record and everything hanging off it.
    ///
    /// Order: soft-delete the QAN instances named in the KV subtree, delete
    /// the subtree, deregister the record. An interrupted purge leaves the
    /// record in place, so the next repair picks it up again, and a UUID is
    /// never dropped from KV before its instance is deleted.
    async fn purge(&self, record: &ServiceRecord, report: &mut RepairReport) -> Result<()> {
        let prefix = record.kv_prefix();

        for entry in self.node.catalog.kv_list(&prefix).await? {
            let key_name = entry.key.rsplit('/').next().unwrap_or_default();
            if Subsystem::from_uuid_key(key_name).is_none() {
                continue;
            }
            let uuid = String::from_utf8_lossy(&entry.value).trim().to_string();
            if uuid.is_empty() {
                continue;
            }
            self.rendezvous.soft_delete(&uuid).await?;
            self.rendezvous.remove_instance_file(&uuid)?;
            report.soft_deleted.push(uuid);
        }

        self.node.catalog.kv_delete_tree(&prefix).await?;
        self.node
            .catalog
            .deregister_service(&self.node.node_name, &record.id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{AgentInstance, ServiceMeta, ServiceType};
    use crate::catalog::memory::MemoryCatalog;
    use crate::catalog::Catalog;
    use crate::error::AdminError;
    use crate::qan::fake::FakeQan;
    use crate::supervisor::fake::FakeSupervisor;

    struct Harness {
        _dir: tempfile::TempDir,
        catalog: Arc<MemoryCatalog>,
        qan: Arc<FakeQan>,
        supervisor: Arc<FakeSupervisor>,
        engine: ReconciliationEngine,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let qan = Arc::new(FakeQan::new());
        let supervisor = Arc::new(FakeSupervisor::new());
        let instance_dir = dir.path().join("instance");
        let rendezvous = Arc::new(AgentRendezvous::new(qan.clone(), instance_dir, "test"));
        let engine = ReconciliationEngine::new(
            NodeCatalog::new(catalog.clone(), "node1", "10.0.0.1"),
            supervisor.clone(),
            rendezvous,
        );
        Harness {
            _dir: dir,
            catalog,
            qan,
            supervisor,
            engine,
        }
    }

    async fn register(
        h: &Harness,
        service_type: ServiceType,
        port: u16,
        alias: &str,
    ) -> ServiceRecord {
        let meta = ServiceMeta::with_alias(alias);
        let record = ServiceRecord::new(service_type, port, meta, "node1", "10.0.0.1");
        h.catalog.register_service(&record).await.unwrap();
        h.catalog
            .kv_put(&format!("{}dsn", record.kv_prefix()), b"u:***@tcp(h:3306)/")
            .await
            .unwrap();
        record
    }

    /// A queries record whose KV names a live QAN instance, with no local agent.
    async fn queries_without_agent(h: &Harness) -> ServiceRecord {
        let record = register(h, ServiceType::Queries, 42001, "db1").await;
        h.qan.insert(AgentInstance {
            uuid: "inst-db1".to_string(),
            subsystem: "mysql".to_string(),
            parent_uuid: "os-1".to_string(),
            name: "db1".to_string(),
            ..Default::default()
        });
        h.catalog
            .kv_put(&format!("{}db1/qan_mysql_uuid", record.kv_prefix()), b"inst-db1")
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_diff_both_directions() {
        let h = harness();
        let kept = register(&h, ServiceType::LinuxMetrics, 42000, "node1").await;
        h.supervisor.add_bare(&kept.local_name());
        let missing = register(&h, ServiceType::MysqlMetrics, 42002, "db1").await;
        h.supervisor.add_bare("pmm-mongodb-metrics-42003");
        h.supervisor.add_bare("sshd");

        let diff = h.engine.diff().await.unwrap();
        assert_eq!(diff.orphaned_local, vec!["pmm-mongodb-metrics-42003".to_string()]);
        assert_eq!(diff.missing_remote, vec![missing]);
    }

    #[tokio::test]
    async fn test_repair_is_idempotent() {
        let h = harness();
        let kept = register(&h, ServiceType::LinuxMetrics, 42000, "node1").await;
        h.supervisor.add_bare(&kept.local_name());
        register(&h, ServiceType::MysqlMetrics, 42002, "db1").await;
        queries_without_agent(&h).await;
        h.supervisor.add_bare("pmm-mongodb-metrics-42003");

        let report = h.engine.repair(false).await.unwrap();
        assert_eq!(report.uninstalled, vec!["pmm-mongodb-metrics-42003".to_string()]);
        assert_eq!(
            report.deregistered,
            vec!["mysql:metrics-42002".to_string(), "queries-42001".to_string()]
        );
        assert_eq!(report.soft_deleted, vec!["inst-db1".to_string()]);
        assert!(h.qan.instance("inst-db1").unwrap().is_deleted());

        assert!(h.engine.diff().await.unwrap().is_empty());
        let second = h.engine.repair(false).await.unwrap();
        assert!(second.is_empty());

        // Only the healthy record's keys survive.
        assert_eq!(h.catalog.kv_keys(), vec!["node1/linux:metrics-42000/dsn".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_soft_delete_keeps_uuid_in_kv() {
        let h = harness();
        let record = queries_without_agent(&h).await;
        h.qan.fail_next_delete();

        let err = h.engine.repair(false).await.unwrap_err();
        assert!(matches!(err, AdminError::RemoteApi { status: 500, .. }));

        let uuid_key = format!("{}db1/qan_mysql_uuid", record.kv_prefix());
        assert!(h.catalog.kv_keys().contains(&uuid_key));
        assert_eq!(h.engine.diff().await.unwrap().missing_remote, vec![record]);

        h.engine.repair(false).await.unwrap();
        assert!(h.engine.diff().await.unwrap().is_empty());
        assert!(h.qan.instance("inst-db1").unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_crash_between_steps_is_resumed() {
        for failing_step in ["kv_delete_tree", "deregister_service"] {
            let h = harness();
            let record = queries_without_agent(&h).await;
            h.catalog.fail_next(failing_step);

            assert!(h.engine.repair(false).await.is_err(), "{}", failing_step);

            // The instance is gone remotely but the record is still there to drive a retry.
            assert!(h.qan.instance("inst-db1").unwrap().is_deleted());
            assert_eq!(h.engine.diff().await.unwrap().missing_remote, vec![record.clone()]);

            h.engine.repair(false).await.unwrap();
            assert!(h.engine.diff().await.unwrap().is_empty(), "{}", failing_step);
            assert!(h.catalog.kv_keys().is_empty());
        }
    }

    #[tokio::test]
    async fn test_ignore_errors_attempts_everything() {
        let h = harness();
        h.supervisor.add_bare("pmm-mysql-metrics-42010");
        h.supervisor.add_bare("pmm-mysql-metrics-42011");
        h.supervisor.fail_next("uninstall:pmm-mysql-metrics-42010");
        queries_without_agent(&h).await;
        h.qan.fail_next_delete();

        let report = h.engine.repair(true).await.unwrap();
        assert_eq!(report.uninstalled, vec!["pmm-mysql-metrics-42011".to_string()]);
        assert!(report.deregistered.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed[0].contains("pmm-mysql-metrics-42010"));
        assert!(report.failed[1].starts_with("queries-42001"));
        assert_eq!(h.supervisor.names(), vec!["pmm-mysql-metrics-42010".to_string()]);

        let second = h.engine.repair(true).await.unwrap();
        assert_eq!(second.uninstalled, vec!["pmm-mysql-metrics-42010".to_string()]);
        assert_eq!(second.deregistered, vec!["queries-42001".to_string()]);
        assert!(second.failed.is_empty());
    }

    #[tokio::test]
    async fn test_without_ignore_errors_first_failure_aborts() {
        let h = harness();
        h.supervisor.add_bare("pmm-mysql-metrics-42010");
        h.supervisor.add_bare("pmm-mysql-metrics-42011");
        h.supervisor.fail_next("uninstall:pmm-mysql-metrics-42010");

        let err = h.engine.repair(false).await.unwrap_err();
        assert!(matches!(err, AdminError::Supervisor { .. }));
        assert_eq!(h.supervisor.names().len(), 2);
    }
}
