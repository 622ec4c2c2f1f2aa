//! OAuth token refresh.
//!
//! Only the `refresh_token` grant is handled here. The authorization-code
//! flow and dynamic client registration happen elsewhere; the broker consumes
//! their results from the store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::BrokerError;

/// Token endpoint response for a refresh grant.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds. Absent means the provider did not say.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Rotated refresh token. Absent means keep the current one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("rotated_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Static OAuth application credentials for one integration.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("has_client_secret", &self.client_secret.is_some())
            .finish()
    }
}

/// Per-integration client credentials. Integrations without an entry refresh
/// with the refresh token alone.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_integration: HashMap<String, ClientCredentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, integration: impl Into<String>, creds: ClientCredentials) {
        self.by_integration.insert(integration.into(), creds);
    }

    pub fn get(&self, integration: &str) -> Option<&ClientCredentials> {
        self.by_integration.get(integration)
    }

    pub fn len(&self) -> usize {
        self.by_integration.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_integration.is_empty()
    }
}

/// Exchanges a refresh token for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        token_endpoint: &str,
        refresh_token: &str,
        credentials: Option<&ClientCredentials>,
    ) -> Result<TokenResponse, BrokerError>;
}

/// [`TokenRefresher`] that POSTs a form-encoded grant with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Form fields for a `refresh_token` grant.
pub fn refresh_form<'a>(
    refresh_token: &'a str,
    credentials: Option<&'a ClientCredentials>,
) -> Vec<(&'static str, &'a str)> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if let Some(creds) = credentials {
        params.push(("client_id", creds.client_id.as_str()));
        if let Some(secret) = creds.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
    }
    params
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        token_endpoint: &str,
        refresh_token: &str,
        credentials: Option<&ClientCredentials>,
    ) -> Result<TokenResponse, BrokerError> {
        let params = refresh_form(refresh_token, credentials);
        debug!(token_endpoint, with_client_id = credentials.is_some(), "Refreshing OAuth token");

        let resp = self
            .client
            .post(token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| BrokerError::RefreshFailed(format!("Token endpoint unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::RefreshFailed(format!(
                "Token refresh HTTP {status}: {body}"
            )));
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| BrokerError::RefreshFailed(format!("Token refresh parse error: {e}")))
    }
}
