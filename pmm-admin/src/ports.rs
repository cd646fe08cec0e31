use std::collections::HashMap;
use crate::catalog::NodeCatalog;
use crate::error::{AdminError, Result};

/// Width of the probe window above the default port.
pub const PROBE_RANGE: u16 = 1000;

/// Picks ports for new exporters from the node's registered services.
///
/// The check is local and not atomic: a concurrent invocation can pick the
/// same port before either registers. A duplicate service id overwrites the
/// earlier registration in the catalog.
pub struct PortAllocator {
    node: NodeCatalog,
}

impl PortAllocator {
    pub fn new(node: NodeCatalog) -> Self {
        Self { node }
    }

    /// `requested > 0` must be free; `requested == 0` probes from `default`.
    pub async fn choose(&self, requested: u16, default: u16) -> Result<u16> {
        let used: HashMap<u16, String> = self
            .node
            .services()
            .await?
            .into_iter()
            .map(|s| (s.port, s.id))
            .collect();

        if requested > 0 {
            if let Some(service_id) = used.get(&requested) {
                return Err(AdminError::PortInUse {
                    port: requested,
                    service_id: service_id.clone(),
                });
            }
            return Ok(requested);
        }

        let last = default.saturating_add(PROBE_RANGE - 1);
        let port = (default..=last)
            .find(|p| !used.contains_key(p))
            .ok_or(AdminError::PortRangeExhausted { first: default, last })?;

        tracing::debug!("Chose port {} (default {})", port, default);
        Ok(port)
    }
}
