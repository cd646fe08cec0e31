use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use shared::protocol::{QAN_API_PREFIX, QAN_API_VERSION_HEADER};
use shared::types::AgentInstance;
use crate::error::{AdminError, Result, Subsystem};
use crate::http::{is_not_found, ApiClient, HttpSettings};
use crate::qan::{AgentCommand, QanApi, RelayOutcome};

/// HTTP client for the QAN API mounted under `/qan-api` on the PMM server.
#[derive(Debug, Clone)]
pub struct QanClient {
    api: ApiClient,
}

impl QanClient {
    pub fn new(server_url: &str, settings: &HttpSettings) -> Result<Self> {
        let base = format!("{}{}", server_url.trim_end_matches('/'), QAN_API_PREFIX);
        Ok(Self {
            api: ApiClient::new(base, Subsystem::QanApi, settings)?,
        })
    }

    fn protocol(reason: impl Into<String>) -> AdminError {
        AdminError::Protocol {
            subsystem: Subsystem::QanApi,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl QanApi for QanClient {
    async fn ping(&self) -> Result<String> {
        let resp = self.api.send_ok(Method::GET, "/ping", None).await?;
        resp.headers()
            .get(QAN_API_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                Self::protocol(format!(
                    "{} answered /ping without {}; is this a PMM server?",
                    self.api.url(""),
                    QAN_API_VERSION_HEADER
                ))
            })
    }

    async fn find_instance(
        &self,
        subsystem: &str,
        name: &str,
        parent_uuid: &str,
    ) -> Result<Option<AgentInstance>> {
        let query = [("type", subsystem), ("name", name), ("parent_uuid", parent_uuid)];
        let resp = self
            .api
            .send_query(Method::GET, "/instances", &query, None)
            .await?;
        if is_not_found(&resp) {
            return Ok(None);
        }
        let resp = self.api.check(Method::GET, resp).await?;
        Ok(Some(self.api.json(resp).await?))
    }

    async fn list_instances(&self) -> Result<Vec<AgentInstance>> {
        let resp = self
            .api
            .send_query(Method::GET, "/instances", &[("deleted", "yes")], None)
            .await?;
        let resp = self.api.check(Method::GET, resp).await?;
        self.api.json(resp).await
    }

    async fn get_instance(&self, uuid: &str) -> Result<Option<AgentInstance>> {
        let resp = self
            .api
            .send(Method::GET, &format!("/instances/{}", uuid), None)
            .await?;
        if is_not_found(&resp) {
            return Ok(None);
        }
        let resp = self.api.check(Method::GET, resp).await?;
        Ok(Some(self.api.json(resp).await?))
    }

    async fn create_instance(&self, instance: &AgentInstance) -> Result<String> {
        let body = serde_json::to_vec(instance)?;
        let resp = self
            .api
            .send_ok(Method::POST, "/instances", Some(body))
            .await?;

        // The POST body is not the created record. The record lives behind
        // Location, which may carry the server's internal host, so only its
        // last path segment is used against our own base URL.
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Self::protocol("POST /instances returned no Location header"))?;
        let id = location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Self::protocol(format!("unusable Location header: {}", location)))?
            .to_string();

        let created = self
            .get_instance(&id)
            .await?
            .ok_or_else(|| {
                Self::protocol(format!("created instance {} not found at {}", id, location))
            })?;
        Ok(created.uuid)
    }

    async fn update_instance(&self, instance: &AgentInstance) -> Result<()> {
        let body = serde_json::to_vec(instance)?;
        self.api
            .send_ok(Method::PUT, &format!("/instances/{}", instance.uuid), Some(body))
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, uuid: &str) -> Result<()> {
        let resp = self
            .api
            .send(Method::DELETE, &format!("/instances/{}", uuid), None)
            .await?;
        if is_not_found(&resp) {
            tracing::debug!("Instance {} already gone", uuid);
            return Ok(());
        }
        self.api.check(Method::DELETE, resp).await?;
        Ok(())
    }

    async fn send_command(&self, agent_uuid: &str, cmd: &AgentCommand) -> Result<RelayOutcome> {
        let body = serde_json::to_vec(cmd)?;
        let resp = self
            .api
            .send(Method::PUT, &format!("/agents/{}/cmd", agent_uuid), Some(body))
            .await?;

        let status = resp.status();
        let body = self.api.bytes(resp).await?;
        Ok(match status {
            StatusCode::OK => RelayOutcome::Delivered(body),
            StatusCode::NOT_FOUND => RelayOutcome::AgentNotConnected,
            other => RelayOutcome::Rejected {
                status: other.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            },
        })
    }
}
