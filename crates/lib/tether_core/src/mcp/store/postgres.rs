//! PostgreSQL credential store.
//!
//! Raw SQLx queries over `integration_connections` and
//! `connection_tool_grants`. Tokens are encrypted with [`TokenCipher`] on the
//! way in and decrypted on the way out; rows never leave this module with
//! ciphertext.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::CredentialStore;
use crate::mcp::BrokerError;
use crate::mcp::secrets::TokenCipher;
use crate::models::connection::{
    Connection, ConnectionWithGrants, IntegrationConnectionRow, NewConnection, TokenUpdate,
    ToolGrant, ToolGrantRow,
};
use crate::uuid::uuidv7;

const CONNECTION_COLUMNS: &str = "id, user_id, integration_name, is_active, \
     access_token_encrypted, refresh_token_encrypted, expires_at, \
     registered_server_url, created_at, updated_at";

/// [`CredentialStore`] backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    cipher: TokenCipher,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode(&self, row: IntegrationConnectionRow) -> Result<Connection, BrokerError> {
        Ok(Connection {
            id: row.id,
            user_id: row.user_id,
            integration_name: row.integration_name,
            is_active: row.is_active,
            access_token: self.cipher.decrypt_opt(row.access_token_encrypted.as_deref())?,
            refresh_token: self.cipher.decrypt_opt(row.refresh_token_encrypted.as_deref())?,
            expires_at: row.expires_at,
            registered_server_url: row.registered_server_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_connection(
        &self,
        user_id: &str,
        integration_name: &str,
    ) -> Result<Option<Connection>, BrokerError> {
        let row = sqlx::query_as::<_, IntegrationConnectionRow>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM integration_connections \
             WHERE user_id = $1 AND integration_name = $2"
        ))
        .bind(user_id)
        .bind(integration_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.decode(r)).transpose()
    }

    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<Connection>, BrokerError> {
        let row = sqlx::query_as::<_, IntegrationConnectionRow>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM integration_connections WHERE id = $1"
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.decode(r)).transpose()
    }

    async fn list_active_connections_with_enabled_tools(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionWithGrants>, BrokerError> {
        let rows = sqlx::query_as::<_, IntegrationConnectionRow>(
            r#"
            SELECT c.id, c.user_id, c.integration_name, c.is_active,
                   c.access_token_encrypted, c.refresh_token_encrypted, c.expires_at,
                   c.registered_server_url, c.created_at, c.updated_at
            FROM integration_connections c
            WHERE c.user_id = $1
              AND c.is_active = true
              AND c.access_token_encrypted IS NOT NULL
              AND EXISTS (
                SELECT 1 FROM connection_tool_grants g
                WHERE g.connection_id = c.id AND g.is_enabled = true
              )
            ORDER BY c.created_at, c.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let grant_rows = sqlx::query_as::<_, ToolGrantRow>(
            r#"
            SELECT connection_id, tool_name, is_enabled
            FROM connection_tool_grants
            WHERE connection_id = ANY($1) AND is_enabled = true
            ORDER BY tool_name
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            let grants: Vec<ToolGrant> = grant_rows
                .iter()
                .filter(|g| g.connection_id == id)
                .cloned()
                .map(ToolGrant::from)
                .collect();
            result.push(ConnectionWithGrants {
                connection: self.decode(row)?,
                grants,
            });
        }
        Ok(result)
    }

    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        update: &TokenUpdate,
    ) -> Result<bool, BrokerError> {
        let access = self.cipher.encrypt(&update.access_token)?;
        let refresh = self.cipher.encrypt_opt(update.refresh_token.as_deref())?;
        let result = sqlx::query(
            r#"
            UPDATE integration_connections
            SET access_token_encrypted = $2,
                refresh_token_encrypted = $3,
                expires_at = $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(connection_id)
        .bind(access)
        .bind(refresh)
        .bind(update.expires_at)
        .bind(update.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_connection_cascade(&self, connection_id: Uuid) -> Result<bool, BrokerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM connection_tool_grants WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM integration_connections WHERE id = $1")
            .bind(connection_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn upsert_connection(&self, new: &NewConnection) -> Result<Connection, BrokerError> {
        let access = self.cipher.encrypt(&new.access_token)?;
        let refresh = self.cipher.encrypt_opt(new.refresh_token.as_deref())?;
        let row = sqlx::query_as::<_, IntegrationConnectionRow>(&format!(
            r#"
            INSERT INTO integration_connections
                (id, user_id, integration_name, is_active,
                 access_token_encrypted, refresh_token_encrypted, expires_at,
                 registered_server_url)
            VALUES ($1, $2, $3, true, $4, $5, $6, $7)
            ON CONFLICT (user_id, integration_name)
            DO UPDATE SET is_active = true,
                          access_token_encrypted = EXCLUDED.access_token_encrypted,
                          refresh_token_encrypted = EXCLUDED.refresh_token_encrypted,
                          expires_at = EXCLUDED.expires_at,
                          registered_server_url = EXCLUDED.registered_server_url,
                          updated_at = now()
            RETURNING {CONNECTION_COLUMNS}
            "#
        ))
        .bind(uuidv7())
        .bind(&new.user_id)
        .bind(&new.integration_name)
        .bind(access)
        .bind(refresh)
        .bind(new.expires_at)
        .bind(&new.registered_server_url)
        .fetch_one(&self.pool)
        .await?;
        self.decode(row)
    }

    async fn set_connection_active(
        &self,
        connection_id: Uuid,
        is_active: bool,
    ) -> Result<bool, BrokerError> {
        let result = sqlx::query(
            "UPDATE integration_connections SET is_active = $2, updated_at = now() WHERE id = $1",
        )
        .bind(connection_id)
        .bind(is_active)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_tool_grant(
        &self,
        connection_id: Uuid,
        tool_name: &str,
        is_enabled: bool,
    ) -> Result<ToolGrant, BrokerError> {
        let row = sqlx::query_as::<_, ToolGrantRow>(
            r#"
            INSERT INTO connection_tool_grants (connection_id, tool_name, is_enabled)
            VALUES ($1, $2, $3)
            ON CONFLICT (connection_id, tool_name)
            DO UPDATE SET is_enabled = EXCLUDED.is_enabled, updated_at = now()
            RETURNING connection_id, tool_name, is_enabled
            "#,
        )
        .bind(connection_id)
        .bind(tool_name)
        .bind(is_enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, BrokerError> {
        let rows = sqlx::query_as::<_, IntegrationConnectionRow>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM integration_connections \
             WHERE user_id = $1 ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| self.decode(r)).collect()
    }
}
