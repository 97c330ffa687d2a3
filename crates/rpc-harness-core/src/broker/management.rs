//! Client for a RabbitMQ-style management HTTP API.
//!
//! Implements [`BrokerAdmin`] with:
//!
//! | operation          | request                                   |
//! |--------------------|-------------------------------------------|
//! | `create_vhost`     | `PUT /api/vhosts/{vhost}` then `PUT /api/permissions/{vhost}/{user}` |
//! | `delete_vhost`     | `DELETE /api/vhosts/{vhost}`              |
//! | `list_vhosts`      | `GET /api/vhosts`                         |
//! | `list_connections` | `GET /api/vhosts/{vhost}/connections`     |

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::ManagementConfig;
use crate::error::{BrokerError, BrokerResult};

use super::{BrokerAdmin, ConnectionRecord};

/// Management API client.
#[derive(Debug, Clone)]
pub struct ManagementClient {
    base: Url,
    username: String,
    password: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ApiVhost {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiConnection {
    name: String,
    #[serde(default)]
    vhost: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    client_properties: Option<ApiClientProperties>,
}

#[derive(Debug, Deserialize)]
struct ApiClientProperties {
    #[serde(default)]
    connection_name: Option<String>,
}

impl From<ApiConnection> for ConnectionRecord {
    fn from(conn: ApiConnection) -> Self {
        Self {
            name: conn.name,
            vhost: conn.vhost,
            user: conn.user,
            client: conn.client_properties.and_then(|p| p.connection_name),
        }
    }
}

impl ManagementClient {
    /// Create a client from configuration. Credentials are env-expanded.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI does not parse or the HTTP client cannot
    /// be built.
    pub fn new(config: &ManagementConfig) -> BrokerResult<Self> {
        let base = Url::parse(&config.uri)
            .map_err(|e| BrokerError::Transport(format!("invalid management uri '{}': {e}", config.uri)))?;
        if base.cannot_be_a_base() {
            return Err(BrokerError::Transport(format!(
                "management uri '{}' cannot be a base",
                config.uri
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(transport)?;

        Ok(Self {
            base,
            username: config.username(),
            password: config.password(),
            client,
        })
    }

    /// Base URI of the API.
    #[must_use]
    pub fn base_uri(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> BrokerResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| BrokerError::Transport(format!("'{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> BrokerResult<Response> {
        debug!(method = %method, url = %url, "management request");
        let mut request = self
            .client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(&body);
        }
        request.send().await.map_err(transport)
    }

    /// Grant `user` full permissions on `vhost`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API rejects the request.
    pub async fn grant_permissions(&self, vhost: &str, user: &str) -> BrokerResult<()> {
        let url = self.url(&["permissions", vhost, user])?;
        let response = self
            .send(
                Method::PUT,
                url,
                Some(json!({ "configure": ".*", "write": ".*", "read": ".*" })),
            )
            .await?;
        expect_success(response, vhost).await.map(drop)
    }
}

#[async_trait]
impl BrokerAdmin for ManagementClient {
    #[instrument(skip(self), fields(base = %self.base))]
    async fn create_vhost(&self, vhost: &str) -> BrokerResult<()> {
        let url = self.url(&["vhosts", vhost])?;
        let response = self.send(Method::PUT, url, Some(json!({}))).await?;
        expect_success(response, vhost).await?;
        self.grant_permissions(vhost, &self.username).await?;
        info!(vhost = %vhost, "vhost created");
        Ok(())
    }

    #[instrument(skip(self), fields(base = %self.base))]
    async fn delete_vhost(&self, vhost: &str) -> BrokerResult<()> {
        let url = self.url(&["vhosts", vhost])?;
        let response = self.send(Method::DELETE, url, None).await?;
        expect_success(response, vhost).await?;
        info!(vhost = %vhost, "vhost deleted");
        Ok(())
    }

    async fn list_vhosts(&self) -> BrokerResult<Vec<String>> {
        let url = self.url(&["vhosts"])?;
        let response = self.send(Method::GET, url, None).await?;
        let vhosts: Vec<ApiVhost> = expect_success(response, "")
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(vhosts.into_iter().map(|v| v.name).collect())
    }

    async fn list_connections(&self, vhost: &str) -> BrokerResult<Vec<ConnectionRecord>> {
        let url = self.url(&["vhosts", vhost, "connections"])?;
        let response = self.send(Method::GET, url, None).await?;
        let connections: Vec<ApiConnection> = expect_success(response, vhost)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(connections.into_iter().map(ConnectionRecord::from).collect())
    }
}

/// Map non-success statuses to broker errors; 404 means the vhost is unknown.
async fn expect_success(response: Response, vhost: &str) -> BrokerResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND && !vhost.is_empty() {
        return Err(BrokerError::UnknownVhost(vhost.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(BrokerError::Management {
        status: status.as_u16(),
        message,
    })
}

fn transport(err: reqwest::Error) -> BrokerError {
    BrokerError::Transport(err.to_string())
}
