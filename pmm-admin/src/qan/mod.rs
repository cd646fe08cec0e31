//! Query-analytics (QAN) API: instance lifecycle and agent command relay.

pub mod agent;
pub mod client;
pub mod rendezvous;
pub mod retry;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::protocol::QAN_CMD_SERVICE;
use shared::types::AgentInstance;
use crate::error::Result;

/// Command relayed to an agent through the QAN API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentCommand {
    pub user: String,
    pub service: String,
    pub cmd: String,
    /// Raw payload; base64 on the wire like any Go `[]byte`
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl AgentCommand {
    pub fn qan(user: impl Into<String>, cmd: &str, data: Vec<u8>) -> Self {
        Self {
            user: user.into(),
            service: QAN_CMD_SERVICE.to_string(),
            cmd: cmd.to_string(),
            data,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Result of one relay attempt, classified by HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// 200: the agent answered; its reply body.
    Delivered(Vec<u8>),
    /// 404: the agent has not connected to the API yet.
    AgentNotConnected,
    /// Anything else.
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait QanApi: Send + Sync {
    /// Liveness probe; returns the API version header.
    async fn ping(&self) -> Result<String>;

    /// First instance matching `(subsystem, name, parent_uuid)`. The server
    /// may ignore `parent_uuid`; callers re-verify.
    async fn find_instance(
        &self,
        subsystem: &str,
        name: &str,
        parent_uuid: &str,
    ) -> Result<Option<AgentInstance>>;

    /// Every instance the server knows, soft-deleted ones included.
    async fn list_instances(&self) -> Result<Vec<AgentInstance>>;

    async fn get_instance(&self, uuid: &str) -> Result<Option<AgentInstance>>;

    /// Create an instance and return the UUID the server assigned.
    async fn create_instance(&self, instance: &AgentInstance) -> Result<String>;

    async fn update_instance(&self, instance: &AgentInstance) -> Result<()>;

    /// Soft delete. An already missing instance is not an error.
    async fn delete_instance(&self, uuid: &str) -> Result<()>;

    /// One relay attempt, no retries.
    async fn send_command(&self, agent_uuid: &str, cmd: &AgentCommand) -> Result<RelayOutcome>;
}
