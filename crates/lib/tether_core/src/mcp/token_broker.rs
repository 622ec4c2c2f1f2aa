//! Token broker.
//!
//! Hands out a usable access token for a connection, refreshing it through
//! the integration's token endpoint when it has expired. At most one refresh
//! runs per connection at a time. Callers that arrive while it is in flight
//! wait for it and receive its outcome, token or error, without calling the
//! endpoint again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::BrokerError;
use super::oauth::{StaticCredentials, TokenRefresher};
use super::registry::IntegrationRegistry;
use super::store::CredentialStore;
use crate::models::connection::{Connection, TokenUpdate};

/// Lifetime assumed when the token endpoint omits `expires_in` (1 hour).
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Default bound on a single token endpoint call (15 seconds).
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one refresh, shared by every caller that waited on it.
type Flight = Arc<OnceCell<Result<String, BrokerError>>>;

pub struct TokenBroker {
    store: Arc<dyn CredentialStore>,
    registry: Arc<IntegrationRegistry>,
    refresher: Arc<dyn TokenRefresher>,
    credentials: StaticCredentials,
    leeway: chrono::Duration,
    refresh_timeout: Duration,
    in_flight: DashMap<Uuid, Flight>,
}

impl TokenBroker {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        registry: Arc<IntegrationRegistry>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            store,
            registry,
            refresher,
            credentials: StaticCredentials::default(),
            leeway: chrono::Duration::zero(),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: StaticCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Treat tokens expiring within `leeway` as already expired.
    pub fn with_leeway(mut self, leeway: chrono::Duration) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<IntegrationRegistry> {
        &self.registry
    }

    /// Number of connections with a refresh currently running or awaited.
    pub fn locks_in_use(&self) -> usize {
        self.in_flight.len()
    }

    /// Return a valid access token for `connection`, refreshing if expired.
    ///
    /// - No access token: `MissingCredential`, no network.
    /// - Not expired: the stored token, no network.
    /// - Expired without refresh token: `RefreshUnavailable`, no write.
    /// - Refresh transport, endpoint or timeout error: `RefreshFailed`,
    ///   nothing persisted. Callers that joined the same refresh get the
    ///   same error.
    pub async fn ensure_valid_access_token(
        &self,
        connection: &Connection,
    ) -> Result<String, BrokerError> {
        let Some(token) = connection.access_token.as_deref() else {
            return Err(BrokerError::MissingCredential(connection.id));
        };
        if !connection.is_expired_at(Utc::now(), self.leeway) {
            return Ok(token.to_string());
        }

        let id = connection.id;
        let flight = Arc::clone(&self.in_flight.entry(id).or_default());
        let result = flight
            .get_or_init(|| self.refresh_serialized(id))
            .await
            .as_ref()
            .map(String::clone)
            .map_err(replay);
        drop(flight);
        // The last caller out retires the flight; later callers start afresh.
        self.in_flight
            .remove_if(&id, |_, f| Arc::strong_count(f) == 1);
        result
    }

    /// Refresh path. Runs at most once per flight.
    async fn refresh_serialized(&self, id: Uuid) -> Result<String, BrokerError> {
        // Another holder may have rotated the token while we waited.
        let current = self
            .store
            .get_connection(id)
            .await?
            .ok_or(BrokerError::MissingCredential(id))?;
        let access_token = current
            .access_token
            .clone()
            .ok_or(BrokerError::MissingCredential(id))?;
        if !current.is_expired_at(Utc::now(), self.leeway) {
            debug!(connection_id = %id, "Token already refreshed by a concurrent caller");
            return Ok(access_token);
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            debug!(connection_id = %id, "Token expired and no refresh token stored");
            return Err(BrokerError::RefreshUnavailable(id));
        };

        let integration = &current.integration_name;
        let descriptor = self
            .registry
            .lookup(integration)
            .ok_or_else(|| BrokerError::UnknownIntegration(integration.clone()))?;
        let token_endpoint = descriptor.token_endpoint().ok_or_else(|| {
            BrokerError::RefreshFailed(format!("Integration {integration} has no token endpoint"))
        })?;
        let credentials = self.credentials.get(integration);

        let response = tokio::time::timeout(
            self.refresh_timeout,
            self.refresher
                .refresh(token_endpoint, refresh_token, credentials),
        )
        .await
        .map_err(|_| {
            BrokerError::RefreshFailed(format!(
                "Token refresh timed out ({}s)",
                self.refresh_timeout.as_secs()
            ))
        })?
        .map_err(|e| match e {
            BrokerError::RefreshFailed(_) => e,
            other => BrokerError::RefreshFailed(other.to_string()),
        })?;

        let now = Utc::now();
        let default_lifetime = chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS);
        let lifetime = response
            .expires_in
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(default_lifetime);
        let expires_at = now
            .checked_add_signed(lifetime)
            .or_else(|| now.checked_add_signed(default_lifetime));

        let update = TokenUpdate {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or_else(|| current.refresh_token.clone()),
            expires_at,
            updated_at: now,
        };

        if self.store.update_connection_tokens(id, &update).await? {
            info!(
                connection_id = %id,
                integration = %integration,
                expires_at = ?update.expires_at,
                "Refreshed access token"
            );
        } else {
            warn!(
                connection_id = %id,
                integration = %integration,
                "Connection removed during refresh; rotated token not persisted"
            );
        }
        Ok(update.access_token)
    }
}

/// Copy of a flight's error for each caller that joined it.
fn replay(error: &BrokerError) -> BrokerError {
    match error {
        BrokerError::MissingCredential(id) => BrokerError::MissingCredential(*id),
        BrokerError::RefreshUnavailable(id) => BrokerError::RefreshUnavailable(*id),
        BrokerError::RefreshFailed(msg) => BrokerError::RefreshFailed(msg.clone()),
        BrokerError::UnknownIntegration(name) => BrokerError::UnknownIntegration(name.clone()),
        BrokerError::EncryptionError(msg) => BrokerError::EncryptionError(msg.clone()),
        BrokerError::DbError(e) => BrokerError::DbError(sqlx::Error::Protocol(e.to_string())),
        other => BrokerError::RefreshFailed(other.to_string()),
    }
}
