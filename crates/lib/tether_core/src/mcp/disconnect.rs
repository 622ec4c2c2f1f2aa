//! Disconnect flow.
//!
//! Removes a user's connection to an integration together with its tool
//! grants. Deletion is all-or-nothing.

use tracing::info;
use uuid::Uuid;

use super::BrokerError;
use super::registry::IntegrationRegistry;
use super::store::CredentialStore;

/// Result of a disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Disconnected { connection_id: Uuid },
    /// Nothing to remove. Nothing was mutated.
    NotConnected,
}

/// Disconnect `user_id` from `integration_name`.
///
/// Unknown integrations fail with `UnknownIntegration`. A missing connection
/// is not an error.
pub async fn disconnect(
    store: &dyn CredentialStore,
    registry: &IntegrationRegistry,
    user_id: &str,
    integration_name: &str,
) -> Result<DisconnectOutcome, BrokerError> {
    if registry.lookup(integration_name).is_none() {
        return Err(BrokerError::UnknownIntegration(integration_name.to_string()));
    }

    let Some(connection) = store.find_connection(user_id, integration_name).await? else {
        return Ok(DisconnectOutcome::NotConnected);
    };

    // A concurrent disconnect may have won the race.
    if !store.delete_connection_cascade(connection.id).await? {
        return Ok(DisconnectOutcome::NotConnected);
    }

    info!(
        user_id,
        integration = %integration_name,
        connection_id = %connection.id,
        "Disconnected integration"
    );
    Ok(DisconnectOutcome::Disconnected {
        connection_id: connection.id,
    })
}
