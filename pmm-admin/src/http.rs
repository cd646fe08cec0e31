//! Thin reqwest wrapper shared by the Consul and QAN API clients.
//!
//! Every call goes through one `reqwest::Client` built with the client-wide
//! timeout; failures are tagged with the subsystem they came from.

use std::time::Duration;
use reqwest::{Method, Response, StatusCode, Url};
use crate::error::{AdminError, Result, Subsystem};

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    base: Url,
    subsystem: Subsystem,
    auth: Option<(String, String)>,
}

/// Settings common to every API client.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub insecure_ssl: bool,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            insecure_ssl: false,
            user: None,
            password: None,
        }
    }
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        subsystem: Subsystem,
        settings: &HttpSettings,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .ok()
            .filter(|u| !u.cannot_be_a_base())
            .ok_or_else(|| AdminError::Transport {
                subsystem,
                method: "-".to_string(),
                url: base_url.clone(),
                reason: "not a usable base URL".to_string(),
            })?;

        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.insecure_ssl)
            .build()
            .map_err(|e| AdminError::Transport {
                subsystem,
                method: "-".to_string(),
                url: "-".to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        let auth = settings
            .user
            .as_ref()
            .map(|u| (u.clone(), settings.password.clone().unwrap_or_default()));

        Ok(Self {
            http,
            base_url,
            base,
            subsystem,
            auth,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// The base URL followed by `segments`, each percent-encoded on its own.
    /// A segment may hold any character, `/` included.
    pub fn segments_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.to_string()
    }

    /// Send a request. Any status is returned; only transport failures error.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        self.send_query(method, path, &[], body).await
    }

    pub async fn send_query(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        self.send_to(method, self.url(path), query, body).await
    }

    /// Like `send_query`, with the path built by [`ApiClient::segments_url`].
    pub async fn send_segments<'a>(
        &self,
        method: Method,
        segments: impl IntoIterator<Item = &'a str>,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        self.send_to(method, self.segments_url(segments), query, body).await
    }

    async fn send_to(
        &self,
        method: Method,
        url: String,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        tracing::debug!("{} {}", method, url);

        let mut req = self.http.request(method.clone(), &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some((user, password)) = &self.auth {
            req = req.basic_auth(user, Some(password));
        }
        if let Some(body) = body {
            req = req.header("content-type", "application/json").body(body);
        }

        req.send().await.map_err(|e| AdminError::Transport {
            subsystem: self.subsystem,
            method: method.to_string(),
            url,
            reason: e.to_string(),
        })
    }

    /// Send and require a 2xx answer.
    pub async fn send_ok(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let resp = self.send(method.clone(), path, body).await?;
        self.check(method, resp).await
    }

    /// Turn a non-2xx response into `RemoteApi`, keeping the body for diagnostics.
    pub async fn check(&self, method: Method, resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(self.remote_error(method, resp).await)
    }

    pub async fn remote_error(&self, method: Method, resp: Response) -> AdminError {
        let status = resp.status();
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        AdminError::RemoteApi {
            subsystem: self.subsystem,
            method: method.to_string(),
            url,
            status: status.as_u16(),
            body: body.trim().to_string(),
        }
    }

    pub async fn bytes(&self, resp: Response) -> Result<Vec<u8>> {
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AdminError::Protocol {
                subsystem: self.subsystem,
                reason: format!("failed reading response body: {}", e),
            })
    }

    pub async fn json<T: serde::de::DeserializeOwned>(&self, resp: Response) -> Result<T> {
        let bytes = self.bytes(resp).await?;
        serde_json::from_slice(&bytes).map_err(|e| AdminError::Protocol {
            subsystem: self.subsystem,
            reason: format!("invalid JSON response: {}", e),
        })
    }
}

pub fn is_not_found(resp: &Response) -> bool {
    resp.status() == StatusCode::NOT_FOUND
}
