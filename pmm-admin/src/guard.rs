use shared::types::ServiceType;
use crate::catalog::NodeCatalog;
use crate::error::{AdminError, Result};

/// Cluster-wide uniqueness pre-checks run before any registration.
///
/// Advisory only: two invocations may both pass and register concurrently.
/// The catalog stays the source of truth and conflicts surface on the next
/// check.
pub struct DuplicateGuard {
    node: NodeCatalog,
}

impl DuplicateGuard {
    pub fn new(node: NodeCatalog) -> Self {
        Self { node }
    }

    pub async fn check_global_uniqueness(
        &self,
        service_type: ServiceType,
        alias: &str,
    ) -> Result<()> {
        self.check_node_identity().await?;

        let holders = self
            .node
            .catalog
            .services_with_alias(service_type, alias)
            .await?;

        if let Some(other) = holders.iter().find(|s| s.node_name != self.node.node_name) {
            return Err(AdminError::AliasConflict {
                service_type,
                alias: alias.to_string(),
                node: other.node_name.clone(),
                address: other.node_address.clone(),
            });
        }
        Ok(())
    }

    /// Two machines must not share a node name.
    pub async fn check_node_identity(&self) -> Result<()> {
        let Some(node) = self.node.catalog.node(&self.node.node_name).await? else {
            return Ok(());
        };

        if node.address != self.node.node_address && !node.services.is_empty() {
            return Err(AdminError::NodeIdentityConflict {
                node: node.name,
                address: node.address,
            });
        }
        Ok(())
    }
}
