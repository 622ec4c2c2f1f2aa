//! Tool connection and credential broker.
//!
//! Registry of integrable MCP servers, credential refresh, session
//! construction, tool aggregation, and the connection lifecycle around them.

pub mod aggregator;
pub mod connections;
pub mod disconnect;
pub mod lifecycle;
pub mod oauth;
pub mod registry;
pub mod secrets;
pub mod session;
pub mod store;
pub mod token_broker;

use thiserror::Error;
use uuid::Uuid;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection {0} has no access token")]
    MissingCredential(Uuid),

    #[error("Access token for connection {0} has expired and no refresh token is available")]
    RefreshUnavailable(Uuid),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Unknown integration: {0}")]
    UnknownIntegration(String),

    #[error("Tool discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("Tool {tool} is not allowed for integration {integration}")]
    ToolNotAllowed { integration: String, tool: String },

    #[error("No connection to integration {0}")]
    NotConnected(String),

    #[error("Integration {0} is not available yet")]
    IntegrationUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),
}
