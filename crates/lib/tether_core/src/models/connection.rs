//! Connection and tool-grant models.
//!
//! `Connection` is the decrypted domain view used by the broker. The `*Row`
//! structs mirror the PostgreSQL tables and carry token ciphertext.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

// =============================================================================
// Domain types
// =============================================================================

/// A user's authenticated link to one integration.
#[derive(Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub integration_name: String,
    pub is_active: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// `None` means non-expiring or not yet populated.
    pub expires_at: Option<DateTime<Utc>>,
    /// Session-specific endpoint from dynamic client registration.
    pub registered_server_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Whether the access token expires before `now + leeway`.
    ///
    /// A connection without `expires_at` never counts as expired. A leeway
    /// that overflows the timestamp range counts every expiry as reached.
    pub fn is_expired_at(&self, now: DateTime<Utc>, leeway: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|exp| {
            now.checked_add_signed(leeway)
                .is_none_or(|limit| exp < limit)
        })
    }
}

// Tokens stay out of debug output.
impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("integration_name", &self.integration_name)
            .field("is_active", &self.is_active)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("registered_server_url", &self.registered_server_url)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// A user's enablement of one tool on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolGrant {
    pub connection_id: Uuid,
    pub tool_name: String,
    pub is_enabled: bool,
}

/// A connection together with its enabled tool grants.
#[derive(Debug, Clone)]
pub struct ConnectionWithGrants {
    pub connection: Connection,
    pub grants: Vec<ToolGrant>,
}

/// Token fields written after a successful refresh.
#[derive(Clone)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenUpdate")
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// Credentials supplied when a connection is created or re-authorized.
#[derive(Clone)]
pub struct NewConnection {
    pub user_id: String,
    pub integration_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub registered_server_url: Option<String>,
}

impl std::fmt::Debug for NewConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewConnection")
            .field("user_id", &self.user_id)
            .field("integration_name", &self.integration_name)
            .field("expires_at", &self.expires_at)
            .field("registered_server_url", &self.registered_server_url)
            .finish_non_exhaustive()
    }
}

/// Connection summary for listings (no secrets).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub id: String,
    pub integration_name: String,
    pub is_active: bool,
    pub has_access_token: bool,
    pub expires_at: Option<String>,
    pub updated_at: String,
}

impl From<&Connection> for ConnectionView {
    fn from(c: &Connection) -> Self {
        Self {
            id: c.id.to_string(),
            integration_name: c.integration_name.clone(),
            is_active: c.is_active,
            has_access_token: c.access_token.is_some(),
            expires_at: c.expires_at.map(|e| e.to_rfc3339()),
            updated_at: c.updated_at.to_rfc3339(),
        }
    }
}

// =============================================================================
// DB row structs
// =============================================================================

/// Database row for `integration_connections`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IntegrationConnectionRow {
    pub id: sqlx::types::Uuid,
    pub user_id: String,
    pub integration_name: String,
    pub is_active: bool,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub registered_server_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Database row for `connection_tool_grants`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolGrantRow {
    pub connection_id: sqlx::types::Uuid,
    pub tool_name: String,
    pub is_enabled: bool,
}

impl From<ToolGrantRow> for ToolGrant {
    fn from(row: ToolGrantRow) -> Self {
        Self {
            connection_id: row.connection_id,
            tool_name: row.tool_name,
            is_enabled: row.is_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(expires_at: Option<DateTime<Utc>>) -> Connection {
        let now = Utc::now();
        Connection {
            id: Uuid::now_v7(),
            user_id: "user-1".into(),
            integration_name: "notion".into(),
            is_active: true,
            access_token: Some("secret-access".into()),
            refresh_token: None,
            expires_at,
            registered_server_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn missing_expiry_never_expires() {
        let c = connection(None);
        assert!(!c.is_expired_at(Utc::now(), chrono::Duration::zero()));
    }

    #[test]
    fn past_expiry_is_expired() {
        let c = connection(Some(Utc::now() - chrono::Duration::minutes(1)));
        assert!(c.is_expired_at(Utc::now(), chrono::Duration::zero()));
    }

    #[test]
    fn leeway_pulls_expiry_forward() {
        let c = connection(Some(Utc::now() + chrono::Duration::seconds(20)));
        assert!(!c.is_expired_at(Utc::now(), chrono::Duration::zero()));
        assert!(c.is_expired_at(Utc::now(), chrono::Duration::seconds(60)));
    }

    #[test]
    fn oversized_leeway_counts_as_expired() {
        let c = connection(Some(Utc::now() + chrono::Duration::days(30)));
        let leeway = chrono::Duration::seconds(10_000_000_000_000);
        assert!(c.is_expired_at(Utc::now(), leeway));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let c = connection(None);
        let out = format!("{c:?}");
        assert!(!out.contains("secret-access"));
        assert!(out.contains("has_access_token: true"));
    }
}
