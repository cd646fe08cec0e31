//! In-memory catalog for tests. Several simulated nodes can share one
//! instance, and individual operations can be made to fail once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use async_trait::async_trait;
use shared::types::{ServiceRecord, ServiceType};
use crate::catalog::{Catalog, CatalogNode, KvEntry};
use crate::error::{AdminError, Result, Subsystem};

#[derive(Default)]
struct Inner {
    /// node name -> (address, service id -> record)
    nodes: BTreeMap<String, (String, BTreeMap<String, ServiceRecord>)>,
    kv: BTreeMap<String, Vec<u8>>,
    fail_once: HashSet<&'static str>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` (e.g. "kv_delete_tree") fail.
    pub fn fail_next(&self, op: &'static str) {
        self.inner.lock().unwrap().fail_once.insert(op);
    }

    pub fn kv_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().kv.keys().cloned().collect()
    }

    fn check(inner: &mut Inner, op: &'static str) -> Result<()> {
        if inner.fail_once.remove(op) {
            return Err(AdminError::RemoteApi {
                subsystem: Subsystem::Catalog,
                method: "TEST".to_string(),
                url: op.to_string(),
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn node(&self, node: &str) -> Result<Option<CatalogNode>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "node")?;
        Ok(inner.nodes.get(node).map(|(address, services)| CatalogNode {
            name: node.to_string(),
            address: address.clone(),
            services: services.values().cloned().collect(),
        }))
    }

    async fn register_service(&self, record: &ServiceRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "register_service")?;
        let entry = inner
            .nodes
            .entry(record.node_name.clone())
            .or_insert_with(|| (record.node_address.clone(), BTreeMap::new()));
        entry.0 = record.node_address.clone();
        entry.1.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn deregister_service(&self, node: &str, service_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "deregister_service")?;
        if let Some((_, services)) = inner.nodes.get_mut(node) {
            services.remove(service_id);
        }
        Ok(())
    }

    async fn services_with_alias(
        &self,
        service_type: ServiceType,
        alias: &str,
    ) -> Result<Vec<ServiceRecord>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "services_with_alias")?;
        Ok(inner
            .nodes
            .values()
            .flat_map(|(_, services)| services.values())
            .filter(|s| s.service_type == service_type && s.meta.has_alias(alias))
            .cloned()
            .collect())
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "kv_put")?;
        inner.kv.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "kv_get")?;
        Ok(inner.kv.get(key).cloned())
    }

    async fn kv_list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "kv_list")?;
        Ok(inner
            .kv
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvEntry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn kv_delete_tree(&self, prefix: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&mut inner, "kv_delete_tree")?;
        inner.kv.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
