use std::collections::HashMap;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use shared::types::{ServiceRecord, ServiceType};
use crate::catalog::{tags, Catalog, CatalogNode, KvEntry};
use crate::error::{Result, Subsystem};
use crate::http::{is_not_found, ApiClient, HttpSettings};

/// Consul HTTP API v1 client.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    api: ApiClient,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeResponse {
    node: NodeInfo,
    #[serde(default)]
    services: Option<HashMap<String, AgentService>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    node: String,
    address: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    node: String,
    address: String,
    #[serde(rename = "ServiceID")]
    service_id: String,
    service_name: String,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
    service_port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterRequest<'a> {
    node: &'a str,
    address: &'a str,
    service: AgentService,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeregisterRequest<'a> {
    node: &'a str,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
}

impl ConsulClient {
    pub fn new(server_url: &str, settings: &HttpSettings) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(server_url, Subsystem::Catalog, settings)?,
        })
    }

    fn record(
        node: &str,
        address: &str,
        id: String,
        name: &str,
        tags: Option<Vec<String>>,
        port: u16,
    ) -> Option<ServiceRecord> {
        // Consul itself and services of other tools share the catalog.
        let service_type = match name.parse::<ServiceType>() {
            Ok(t) => t,
            Err(_) => {
                tracing::debug!("Ignoring foreign catalog service {} on {}", id, node);
                return None;
            }
        };

        Some(ServiceRecord {
            id,
            service_type,
            meta: tags::from_tags(&tags.unwrap_or_default()),
            port,
            node_name: node.to_string(),
            node_address: address.to_string(),
        })
    }
}

#[async_trait]
impl Catalog for ConsulClient {
    async fn node(&self, node: &str) -> Result<Option<CatalogNode>> {
        let resp = self
            .api
            .send_segments(Method::GET, ["v1", "catalog", "node", node], &[], None)
            .await?;
        let resp = self.api.check(Method::GET, resp).await?;

        // Consul answers `null` for unknown nodes.
        let body: Option<NodeResponse> = self.api.json(resp).await?;
        let Some(body) = body else {
            return Ok(None);
        };

        let mut services: Vec<ServiceRecord> = body
            .services
            .unwrap_or_default()
            .into_values()
            .filter_map(|s| {
                let node = &body.node;
                Self::record(&node.node, &node.address, s.id, &s.service, s.tags, s.port)
            })
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Some(CatalogNode {
            name: body.node.node,
            address: body.node.address,
            services,
        }))
    }

    async fn register_service(&self, record: &ServiceRecord) -> Result<()> {
        let req = RegisterRequest {
            node: &record.node_name,
            address: &record.node_address,
            service: AgentService {
                id: record.id.clone(),
                service: record.service_type.as_str().to_string(),
                tags: Some(tags::to_tags(&record.meta)),
                port: record.port,
            },
        };
        let body = serde_json::to_vec(&req)?;
        self.api
            .send_ok(Method::PUT, "/v1/catalog/register", Some(body))
            .await?;
        tracing::debug!("Registered {} on node {}", record.id, record.node_name);
        Ok(())
    }

    async fn deregister_service(&self, node: &str, service_id: &str) -> Result<()> {
        let body = serde_json::to_vec(&DeregisterRequest { node, service_id })?;
        self.api
            .send_ok(Method::PUT, "/v1/catalog/deregister", Some(body))
            .await?;
        tracing::debug!("Deregistered {} from node {}", service_id, node);
        Ok(())
    }

    async fn services_with_alias(
        &self,
        service_type: ServiceType,
        alias: &str,
    ) -> Result<Vec<ServiceRecord>> {
        let segments = ["v1", "catalog", "service", service_type.as_str()];
        let tag = tags::alias_tag(alias);
        let resp = self
            .api
            .send_segments(Method::GET, segments, &[("tag", tag.as_str())], None)
            .await?;
        let resp = self.api.check(Method::GET, resp).await?;
        let services: Option<Vec<CatalogService>> = self.api.json(resp).await?;

        Ok(services
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| {
                let (tags, port) = (s.service_tags, s.service_port);
                Self::record(&s.node, &s.address, s.service_id, &s.service_name, tags, port)
            })
            .collect())
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let resp = self
            .api
            .send_segments(Method::PUT, kv_path(key), &[], Some(value.to_vec()))
            .await?;
        self.api.check(Method::PUT, resp).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .api
            .send_segments(Method::GET, kv_path(key), &[("raw", "")], None)
            .await?;
        if is_not_found(&resp) {
            return Ok(None);
        }
        let resp = self.api.check(Method::GET, resp).await?;
        Ok(Some(self.api.bytes(resp).await?))
    }

    async fn kv_list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let resp = self
            .api
            .send_segments(Method::GET, kv_path(prefix), &[("keys", "")], None)
            .await?;
        if is_not_found(&resp) {
            return Ok(Vec::new());
        }
        let resp = self.api.check(Method::GET, resp).await?;
        let keys: Vec<String> = self.api.json(resp).await?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // A key may vanish between listing and reading.
            if let Some(value) = self.kv_get(&key).await? {
                entries.push(KvEntry { key, value });
            }
        }
        Ok(entries)
    }

    async fn kv_delete_tree(&self, prefix: &str) -> Result<()> {
        let resp = self
            .api
            .send_segments(Method::DELETE, kv_path(prefix), &[("recurse", "")], None)
            .await?;
        self.api.check(Method::DELETE, resp).await?;
        Ok(())
    }
}

/// `/v1/kv/` followed by the `/`-separated parts of `key`.
fn kv_path(key: &str) -> impl Iterator<Item = &str> {
    ["v1", "kv"].into_iter().chain(key.split('/'))
}
