//! Credential store boundary.
//!
//! The broker never talks to a database directly. Everything it needs from
//! persistence goes through [`CredentialStore`]; [`postgres`] is the
//! production adapter and [`memory`] backs tests and local runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use super::BrokerError;
use crate::models::connection::{
    Connection, ConnectionWithGrants, NewConnection, TokenUpdate, ToolGrant,
};

pub use memory::MemoryCredentialStore;
pub use postgres::PgCredentialStore;

/// Persistence operations for connections and tool grants.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The connection for (`user_id`, `integration_name`), if any.
    async fn find_connection(
        &self,
        user_id: &str,
        integration_name: &str,
    ) -> Result<Option<Connection>, BrokerError>;

    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<Connection>, BrokerError>;

    /// Active connections with a non-null access token and at least one
    /// enabled grant, ordered by `created_at` then `id`. Only enabled grants
    /// are returned.
    async fn list_active_connections_with_enabled_tools(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionWithGrants>, BrokerError>;

    /// Write rotated tokens. Returns `false` when the row no longer exists.
    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        update: &TokenUpdate,
    ) -> Result<bool, BrokerError>;

    /// Delete the connection and all of its grants atomically.
    /// Returns `false` when there was nothing to delete.
    async fn delete_connection_cascade(&self, connection_id: Uuid) -> Result<bool, BrokerError>;

    /// Create the (user, integration) connection or replace its credentials.
    async fn upsert_connection(&self, new: &NewConnection) -> Result<Connection, BrokerError>;

    async fn set_connection_active(
        &self,
        connection_id: Uuid,
        is_active: bool,
    ) -> Result<bool, BrokerError>;

    async fn upsert_tool_grant(
        &self,
        connection_id: Uuid,
        tool_name: &str,
        is_enabled: bool,
    ) -> Result<ToolGrant, BrokerError>;

    /// All of a user's connections, active or not, in creation order.
    async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, BrokerError>;
}
