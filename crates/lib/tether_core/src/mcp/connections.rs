//! Connection management.
//!
//! User-facing edits to connections: storing credentials after an
//! authorization completes, toggling activation and editing tool grants.

use chrono::Utc;
use tracing::info;

use super::BrokerError;
use super::registry::IntegrationRegistry;
use super::store::CredentialStore;
use crate::models::connection::{Connection, NewConnection, ToolGrant};
use crate::models::integration::IntegrationDescriptor;

/// Credentials handed over by the external authorization step.
#[derive(Clone)]
pub struct ConnectRequest {
    pub user_id: String,
    pub integration_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds, as reported by the provider.
    pub expires_in: Option<i64>,
    pub registered_server_url: Option<String>,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("user_id", &self.user_id)
            .field("integration_name", &self.integration_name)
            .field("expires_in", &self.expires_in)
            .field("registered_server_url", &self.registered_server_url)
            .finish_non_exhaustive()
    }
}

fn activatable<'a>(
    registry: &'a IntegrationRegistry,
    integration_name: &str,
) -> Result<&'a IntegrationDescriptor, BrokerError> {
    let descriptor = registry
        .lookup(integration_name)
        .ok_or_else(|| BrokerError::UnknownIntegration(integration_name.to_string()))?;
    if descriptor.coming_soon {
        return Err(BrokerError::IntegrationUnavailable(integration_name.to_string()));
    }
    Ok(descriptor)
}

/// Create or re-authorize the user's connection. The result is active.
pub async fn connect(
    store: &dyn CredentialStore,
    registry: &IntegrationRegistry,
    request: ConnectRequest,
) -> Result<Connection, BrokerError> {
    activatable(registry, &request.integration_name)?;

    if request.user_id.trim().is_empty() {
        return Err(BrokerError::Validation("user id must not be empty".into()));
    }
    if request.access_token.trim().is_empty() {
        return Err(BrokerError::Validation("access token must not be empty".into()));
    }
    let expires_at = match request.expires_in {
        None => None,
        Some(secs) if secs <= 0 => {
            return Err(BrokerError::Validation(format!(
                "expires_in must be positive, got {secs}"
            )));
        }
        Some(secs) => {
            let lifetime = chrono::Duration::try_seconds(secs).ok_or_else(|| {
                BrokerError::Validation(format!("expires_in out of range: {secs}"))
            })?;
            Some(Utc::now().checked_add_signed(lifetime).ok_or_else(|| {
                BrokerError::Validation(format!("expires_in out of range: {secs}"))
            })?)
        }
    };

    let new = NewConnection {
        user_id: request.user_id,
        integration_name: request.integration_name,
        access_token: request.access_token,
        refresh_token: request.refresh_token.filter(|t| !t.trim().is_empty()),
        expires_at,
        registered_server_url: request
            .registered_server_url
            .filter(|u| !u.trim().is_empty()),
    };
    let connection = store.upsert_connection(&new).await?;
    info!(
        user_id = %connection.user_id,
        integration = %connection.integration_name,
        connection_id = %connection.id,
        "Stored connection credentials"
    );
    Ok(connection)
}

/// Toggle a connection's activation.
pub async fn set_active(
    store: &dyn CredentialStore,
    registry: &IntegrationRegistry,
    user_id: &str,
    integration_name: &str,
    is_active: bool,
) -> Result<Connection, BrokerError> {
    if is_active {
        activatable(registry, integration_name)?;
    } else if registry.lookup(integration_name).is_none() {
        return Err(BrokerError::UnknownIntegration(integration_name.to_string()));
    }

    let not_connected = || BrokerError::NotConnected(integration_name.to_string());
    let connection = store
        .find_connection(user_id, integration_name)
        .await?
        .ok_or_else(not_connected)?;
    if !store.set_connection_active(connection.id, is_active).await? {
        return Err(not_connected());
    }
    info!(
        user_id,
        integration = %integration_name,
        connection_id = %connection.id,
        is_active,
        "Updated connection activation"
    );
    store
        .get_connection(connection.id)
        .await?
        .ok_or_else(not_connected)
}

/// Enable or disable one tool on the user's connection.
///
/// Only tools on the integration's allow-list can be granted.
pub async fn set_tool_grant(
    store: &dyn CredentialStore,
    registry: &IntegrationRegistry,
    user_id: &str,
    integration_name: &str,
    tool_name: &str,
    is_enabled: bool,
) -> Result<ToolGrant, BrokerError> {
    let descriptor = registry
        .lookup(integration_name)
        .ok_or_else(|| BrokerError::UnknownIntegration(integration_name.to_string()))?;
    if !descriptor.allows_tool(tool_name) {
        return Err(BrokerError::ToolNotAllowed {
            integration: integration_name.to_string(),
            tool: tool_name.to_string(),
        });
    }

    let connection = store
        .find_connection(user_id, integration_name)
        .await?
        .ok_or_else(|| BrokerError::NotConnected(integration_name.to_string()))?;
    let grant = store
        .upsert_tool_grant(connection.id, tool_name, is_enabled)
        .await?;
    info!(
        user_id,
        integration = %integration_name,
        tool = %tool_name,
        is_enabled,
        "Updated tool grant"
    );
    Ok(grant)
}

pub async fn list_connections(
    store: &dyn CredentialStore,
    user_id: &str,
) -> Result<Vec<Connection>, BrokerError> {
    store.list_connections(user_id).await
}
