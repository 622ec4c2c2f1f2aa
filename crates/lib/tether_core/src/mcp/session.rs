//! Authenticated tool-server sessions.
//!
//! One session per active connection per turn. Sessions are never pooled;
//! the aggregator hands every opened session to the lifecycle manager for
//! closing.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::model::CallToolRequestParams;
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::BrokerError;
use crate::models::connection::Connection;
use crate::models::integration::IntegrationDescriptor;

/// Default timeout for the MCP initialize handshake (15 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Default timeout for a full `tools/list` walk (30 seconds).
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for a single tool call (30 seconds).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Types
// =============================================================================

/// A tool as advertised by a tool server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A live, authenticated session with one tool server.
#[async_trait]
pub trait ToolSession: Send + Sync {
    fn integration(&self) -> &str;

    fn connection_id(&self) -> Uuid;

    /// Full tool catalog. Fails with `DiscoveryFailed`.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, BrokerError>;

    /// Invoke a remote tool and return its JSON result.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, BrokerError>;

    /// Release the session. Calling twice is allowed.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens sessions for connections.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Fails with `SessionUnavailable` when there is no usable address or the
    /// handshake fails.
    async fn open_session(
        &self,
        connection: &Connection,
        integration: &IntegrationDescriptor,
        access_token: &str,
    ) -> Result<Arc<dyn ToolSession>, BrokerError>;
}

/// Effective server address: the connection's registered URL, else the
/// integration default. Blank strings count as absent.
pub fn resolve_server_url<'a>(
    connection: &'a Connection,
    integration: &'a IntegrationDescriptor,
) -> Option<&'a str> {
    let non_blank = |s: &&str| !s.trim().is_empty();
    connection
        .registered_server_url
        .as_deref()
        .filter(non_blank)
        .or_else(|| integration.server_url.as_deref().filter(non_blank))
}

// =============================================================================
// rmcp Streamable HTTP implementation
// =============================================================================

/// [`SessionFactory`] speaking MCP Streamable HTTP through rmcp.
#[derive(Debug, Clone)]
pub struct RmcpSessionFactory {
    client: reqwest::Client,
    connect_timeout: Duration,
    discovery_timeout: Duration,
    call_timeout: Duration,
}

impl Default for RmcpSessionFactory {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl RmcpSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(mut self, connect: Duration, discovery: Duration, call: Duration) -> Self {
        self.connect_timeout = connect;
        self.discovery_timeout = discovery;
        self.call_timeout = call;
        self
    }
}

#[async_trait]
impl SessionFactory for RmcpSessionFactory {
    async fn open_session(
        &self,
        connection: &Connection,
        integration: &IntegrationDescriptor,
        access_token: &str,
    ) -> Result<Arc<dyn ToolSession>, BrokerError> {
        let url = resolve_server_url(connection, integration).ok_or_else(|| {
            BrokerError::SessionUnavailable(format!(
                "No server address for integration {}",
                integration.name
            ))
        })?;
        url::Url::parse(url).map_err(|e| {
            BrokerError::SessionUnavailable(format!("Invalid server address {url}: {e}"))
        })?;

        let mut config = StreamableHttpClientTransportConfig::with_uri(url);
        // rmcp adds the "Bearer " prefix.
        config.auth_header = Some(access_token.to_string());
        let transport = StreamableHttpClientTransport::with_client(self.client.clone(), config);

        let service: RunningService<RoleClient, ()> =
            tokio::time::timeout(self.connect_timeout, ().serve(transport))
                .await
                .map_err(|_| {
                    BrokerError::SessionUnavailable(format!(
                        "Connecting to {} timed out ({}s)",
                        integration.name,
                        self.connect_timeout.as_secs()
                    ))
                })?
                .map_err(|e| {
                    BrokerError::SessionUnavailable(format!(
                        "Failed to connect to {}: {e}",
                        integration.name
                    ))
                })?;

        info!(
            integration = %integration.name,
            connection_id = %connection.id,
            "Opened tool session"
        );

        Ok(Arc::new(RmcpSession {
            integration: integration.name.clone(),
            connection_id: connection.id,
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            discovery_timeout: self.discovery_timeout,
            call_timeout: self.call_timeout,
        }))
    }
}

/// A running rmcp client session.
pub struct RmcpSession {
    integration: String,
    connection_id: Uuid,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    discovery_timeout: Duration,
    call_timeout: Duration,
}

#[async_trait]
impl ToolSession for RmcpSession {
    fn integration(&self) -> &str {
        &self.integration
    }

    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, BrokerError> {
        // list_all_tools follows pagination cursors.
        let tools = tokio::time::timeout(self.discovery_timeout, self.peer.list_all_tools())
            .await
            .map_err(|_| {
                BrokerError::DiscoveryFailed(format!(
                    "tools/list timed out ({}s)",
                    self.discovery_timeout.as_secs()
                ))
            })?
            .map_err(|e| BrokerError::DiscoveryFailed(format!("tools/list failed: {e}")))?;

        Ok(tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name.to_string(),
                description: t.description.as_deref().map(str::to_string),
                input_schema: Value::Object((*t.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, BrokerError> {
        let params = CallToolRequestParams {
            meta: None,
            name: Cow::Owned(name.to_string()),
            arguments,
            task: None,
        };
        let result = tokio::time::timeout(self.call_timeout, self.peer.call_tool(params))
            .await
            .map_err(|_| {
                BrokerError::ToolCallFailed(format!(
                    "{name} timed out ({}s)",
                    self.call_timeout.as_secs()
                ))
            })?
            .map_err(|e| BrokerError::ToolCallFailed(format!("{name}: {e}")))?;

        serde_json::to_value(&result)
            .map_err(|e| BrokerError::ToolCallFailed(format!("{name}: unserializable result: {e}")))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        service.cancel().await.map_err(|e| {
            BrokerError::SessionUnavailable(format!(
                "Closing {} session failed: {e}",
                self.integration
            ))
        })?;
        debug!(
            integration = %self.integration,
            connection_id = %self.connection_id,
            "Closed tool session"
        );
        Ok(())
    }
}
