//! Service catalog and KV store boundary.
//!
//! The catalog is the cross-machine source of truth for which services are
//! enabled on a node. pmm-admin only consumes it.

pub mod consul;
#[cfg(test)]
pub mod memory;
pub mod tags;

use async_trait::async_trait;
use shared::types::{ServiceRecord, ServiceType};
use crate::error::Result;

/// A node as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub name: String,
    pub address: String,
    pub services: Vec<ServiceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// The node record and its services, None if the node is unknown.
    async fn node(&self, node: &str) -> Result<Option<CatalogNode>>;

    /// Register (or overwrite) a service under `record.node_name`.
    async fn register_service(&self, record: &ServiceRecord) -> Result<()>;

    async fn deregister_service(&self, node: &str, service_id: &str) -> Result<()>;

    /// Services of `service_type` carrying `alias`, on any node.
    async fn services_with_alias(
        &self,
        service_type: ServiceType,
        alias: &str,
    ) -> Result<Vec<ServiceRecord>>;

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`.
    async fn kv_list(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    async fn kv_delete_tree(&self, prefix: &str) -> Result<()>;

    async fn node_services(&self, node: &str) -> Result<Vec<ServiceRecord>> {
        Ok(self.node(node).await?.map(|n| n.services).unwrap_or_default())
    }
}

/// Catalog calls scoped to this client's node.
#[derive(Clone)]
pub struct NodeCatalog {
    pub catalog: std::sync::Arc<dyn Catalog>,
    pub node_name: String,
    pub node_address: String,
}

impl NodeCatalog {
    pub fn new(
        catalog: std::sync::Arc<dyn Catalog>,
        node_name: impl Into<String>,
        node_address: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            node_name: node_name.into(),
            node_address: node_address.into(),
        }
    }

    pub async fn services(&self) -> Result<Vec<ServiceRecord>> {
        self.catalog.node_services(&self.node_name).await
    }

    /// The local service of `service_type` carrying `alias`, if any.
    pub async fn find(
        &self,
        service_type: ServiceType,
        alias: &str,
    ) -> Result<Option<ServiceRecord>> {
        Ok(self
            .services()
            .await?
            .into_iter()
            .find(|s| s.service_type == service_type && s.meta.has_alias(alias)))
    }

    /// The single shared service of `service_type` on this node, if any.
    pub async fn find_type(&self, service_type: ServiceType) -> Result<Option<ServiceRecord>> {
        Ok(self
            .services()
            .await?
            .into_iter()
            .find(|s| s.service_type == service_type))
    }

    pub async fn kv_put_str(&self, key: &str, value: &str) -> Result<()> {
        self.catalog.kv_put(key, value.as_bytes()).await
    }
}
