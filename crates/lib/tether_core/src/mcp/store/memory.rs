//! In-memory credential store.
//!
//! Backs the test suites and embedders that need no database. Same ordering
//! and atomicity guarantees as the PostgreSQL adapter, scoped to one process.
//! Fault injection hooks are only compiled with the `test-util` feature.

use std::collections::BTreeMap;
use std::sync::Mutex;
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::CredentialStore;
use crate::mcp::BrokerError;
use crate::models::connection::{
    Connection, ConnectionWithGrants, NewConnection, TokenUpdate, ToolGrant,
};
use crate::uuid::uuidv7;

#[derive(Default)]
struct State {
    connections: BTreeMap<Uuid, Connection>,
    grants: BTreeMap<(Uuid, String), bool>,
}

impl State {
    fn sorted_for_user(&self, user_id: &str) -> Vec<&Connection> {
        let mut rows: Vec<&Connection> = self
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }

    fn enabled_grants(&self, connection_id: Uuid) -> Vec<ToolGrant> {
        self.grants
            .range((connection_id, String::new())..)
            .take_while(|((id, _), _)| *id == connection_id)
            .filter(|(_, enabled)| **enabled)
            .map(|((id, tool), enabled)| ToolGrant {
                connection_id: *id,
                tool_name: tool.clone(),
                is_enabled: *enabled,
            })
            .collect()
    }
}

/// Process-local [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<State>,
    token_updates: AtomicUsize,
    #[cfg(any(test, feature = "test-util"))]
    fail_listing: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully specified connection, replacing any row with the same id.
    pub fn insert(&self, connection: Connection) {
        self.lock().connections.insert(connection.id, connection);
    }

    /// Number of successful token writes so far.
    #[cfg(any(test, feature = "test-util"))]
    pub fn token_update_count(&self) -> usize {
        self.token_updates.load(Ordering::SeqCst)
    }

    /// Make the aggregation listing fail, simulating an unreachable database.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Grants (enabled or not) recorded for a connection.
    pub fn grants_for(&self, connection_id: Uuid) -> Vec<ToolGrant> {
        let state = self.lock();
        state
            .grants
            .iter()
            .filter(|((id, _), _)| *id == connection_id)
            .map(|((id, tool), enabled)| ToolGrant {
                connection_id: *id,
                tool_name: tool.clone(),
                is_enabled: *enabled,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_connection(
        &self,
        user_id: &str,
        integration_name: &str,
    ) -> Result<Option<Connection>, BrokerError> {
        let state = self.lock();
        Ok(state
            .connections
            .values()
            .find(|c| c.user_id == user_id && c.integration_name == integration_name)
            .cloned())
    }

    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<Connection>, BrokerError> {
        Ok(self.lock().connections.get(&connection_id).cloned())
    }

    async fn list_active_connections_with_enabled_tools(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionWithGrants>, BrokerError> {
        #[cfg(any(test, feature = "test-util"))]
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(BrokerError::DbError(sqlx::Error::PoolTimedOut));
        }
        let state = self.lock();
        let rows = state
            .sorted_for_user(user_id)
            .into_iter()
            .filter(|c| c.is_active && c.access_token.is_some())
            .filter_map(|c| {
                let grants = state.enabled_grants(c.id);
                (!grants.is_empty()).then(|| ConnectionWithGrants {
                    connection: c.clone(),
                    grants,
                })
            })
            .collect();
        Ok(rows)
    }

    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        update: &TokenUpdate,
    ) -> Result<bool, BrokerError> {
        let mut state = self.lock();
        let Some(row) = state.connections.get_mut(&connection_id) else {
            return Ok(false);
        };
        row.access_token = Some(update.access_token.clone());
        row.refresh_token = update.refresh_token.clone();
        row.expires_at = update.expires_at;
        row.updated_at = update.updated_at;
        self.token_updates.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn delete_connection_cascade(&self, connection_id: Uuid) -> Result<bool, BrokerError> {
        let mut state = self.lock();
        state.grants.retain(|(id, _), _| *id != connection_id);
        Ok(state.connections.remove(&connection_id).is_some())
    }

    async fn upsert_connection(&self, new: &NewConnection) -> Result<Connection, BrokerError> {
        let mut state = self.lock();
        let now = Utc::now();
        let existing = state
            .connections
            .values_mut()
            .find(|c| c.user_id == new.user_id && c.integration_name == new.integration_name);

        if let Some(row) = existing {
            row.access_token = Some(new.access_token.clone());
            row.refresh_token = new.refresh_token.clone();
            row.expires_at = new.expires_at;
            row.registered_server_url = new.registered_server_url.clone();
            row.is_active = true;
            row.updated_at = now;
            return Ok(row.clone());
        }

        let connection = Connection {
            id: uuidv7(),
            user_id: new.user_id.clone(),
            integration_name: new.integration_name.clone(),
            is_active: true,
            access_token: Some(new.access_token.clone()),
            refresh_token: new.refresh_token.clone(),
            expires_at: new.expires_at,
            registered_server_url: new.registered_server_url.clone(),
            created_at: now,
            updated_at: now,
        };
        state.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn set_connection_active(
        &self,
        connection_id: Uuid,
        is_active: bool,
    ) -> Result<bool, BrokerError> {
        let mut state = self.lock();
        match state.connections.get_mut(&connection_id) {
            Some(row) => {
                row.is_active = is_active;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_tool_grant(
        &self,
        connection_id: Uuid,
        tool_name: &str,
        is_enabled: bool,
    ) -> Result<ToolGrant, BrokerError> {
        let mut state = self.lock();
        if !state.connections.contains_key(&connection_id) {
            return Err(BrokerError::DbError(sqlx::Error::RowNotFound));
        }
        state
            .grants
            .insert((connection_id, tool_name.to_string()), is_enabled);
        Ok(ToolGrant {
            connection_id,
            tool_name: tool_name.to_string(),
            is_enabled,
        })
    }

    async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, BrokerError> {
        let state = self.lock();
        Ok(state.sorted_for_user(user_id).into_iter().cloned().collect())
    }
}
