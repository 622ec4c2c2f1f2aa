//! Shared fakes for broker integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use tether_core::mcp::BrokerError;
use tether_core::mcp::oauth::{ClientCredentials, TokenRefresher, TokenResponse};
use tether_core::mcp::registry::IntegrationRegistry;
use tether_core::mcp::session::{SessionFactory, ToolDefinition, ToolSession, resolve_server_url};
use tether_core::mcp::store::{CredentialStore, MemoryCredentialStore};
use tether_core::models::connection::Connection;
use tether_core::models::integration::{AuthType, IntegrationDescriptor, OAuthEndpoints};

pub const USER: &str = "user-1";

// =============================================================================
// Registry
// =============================================================================

pub fn oauth_integration(name: &str, allowed: &[&str]) -> IntegrationDescriptor {
    IntegrationDescriptor {
        name: name.into(),
        display_name: name.to_uppercase(),
        auth_type: AuthType::OAuth,
        server_url: Some(format!("https://{name}.test/mcp")),
        scopes: BTreeSet::new(),
        allowed_tools: allowed.iter().map(|s| s.to_string()).collect(),
        oauth_config: Some(OAuthEndpoints {
            authorization_endpoint: format!("https://{name}.test/authorize"),
            token_endpoint: format!("https://{name}.test/token"),
            registration_endpoint: None,
        }),
        coming_soon: false,
    }
}

/// alpha, beta and gamma are OAuth; keys is api-token.
pub fn test_registry() -> Arc<IntegrationRegistry> {
    let mut keys = oauth_integration("keys", &["search"]);
    keys.auth_type = AuthType::ApiToken;
    keys.oauth_config = None;

    let registry = IntegrationRegistry::from_descriptors([
        oauth_integration("alpha", &["search", "fetch", "write"]),
        oauth_integration("beta", &["search", "list"]),
        oauth_integration("gamma", &["search"]),
        keys,
    ])
    .expect("test registry is valid");
    Arc::new(registry)
}

// =============================================================================
// Store seeding
// =============================================================================

pub struct Seed<'a> {
    pub integration: &'a str,
    pub access_token: Option<&'a str>,
    pub refresh_token: Option<&'a str>,
    pub expires_at: Option<DateTime<Utc>>,
    pub grants: &'a [(&'a str, bool)],
}

impl<'a> Seed<'a> {
    pub fn valid(integration: &'a str, grants: &'a [(&'a str, bool)]) -> Self {
        Self {
            integration,
            access_token: Some("valid-token"),
            refresh_token: Some("refresh-token"),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            grants,
        }
    }

    pub fn expired(integration: &'a str, grants: &'a [(&'a str, bool)]) -> Self {
        Self {
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            access_token: Some("stale-token"),
            ..Self::valid(integration, grants)
        }
    }
}

/// Insert a connection with a distinct creation offset so ordering is fixed.
pub async fn seed(store: &MemoryCredentialStore, order: i64, seed: Seed<'_>) -> Connection {
    let created_at = Utc::now() - chrono::Duration::hours(24) + chrono::Duration::seconds(order);
    let connection = Connection {
        id: Uuid::now_v7(),
        user_id: USER.into(),
        integration_name: seed.integration.into(),
        is_active: true,
        access_token: seed.access_token.map(str::to_string),
        refresh_token: seed.refresh_token.map(str::to_string),
        expires_at: seed.expires_at,
        registered_server_url: None,
        created_at,
        updated_at: created_at,
    };
    store.insert(connection.clone());
    for (tool, enabled) in seed.grants {
        store
            .upsert_tool_grant(connection.id, tool, *enabled)
            .await
            .expect("grant");
    }
    connection
}

// =============================================================================
// Token refresher
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Succeed,
    Fail,
    Hang,
}

pub struct FakeRefresher {
    pub calls: AtomicUsize,
    pub mode: Mutex<RefreshMode>,
    pub delay: Duration,
    pub expires_in: Option<i64>,
    pub rotate_refresh_token: bool,
    pub seen_credentials: Mutex<Vec<Option<ClientCredentials>>>,
}

impl FakeRefresher {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: Mutex::new(RefreshMode::Succeed),
            delay: Duration::ZERO,
            expires_in: Some(3600),
            rotate_refresh_token: true,
            seen_credentials: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_mode(self, mode: RefreshMode) -> Self {
        *self.mode.lock().unwrap() = mode;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(
        &self,
        _token_endpoint: &str,
        refresh_token: &str,
        credentials: Option<&ClientCredentials>,
    ) -> Result<TokenResponse, BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_credentials
            .lock()
            .unwrap()
            .push(credentials.cloned());
        let mode = *self.mode.lock().unwrap();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match mode {
            RefreshMode::Succeed => Ok(TokenResponse {
                access_token: format!("refreshed-{n}"),
                token_type: Some("bearer".into()),
                expires_in: self.expires_in,
                refresh_token: self
                    .rotate_refresh_token
                    .then(|| format!("{refresh_token}-rotated-{n}")),
                scope: None,
            }),
            RefreshMode::Fail => Err(BrokerError::RefreshFailed("HTTP 400: invalid_grant".into())),
            RefreshMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BrokerError::RefreshFailed("unreachable".into()))
            }
        }
    }
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<&'static str>,
    pub fail_open: bool,
    pub hang_open: bool,
    pub fail_list: bool,
    pub hang_list: bool,
}

impl FakeServer {
    pub fn with_tools(tools: &[&'static str]) -> Self {
        Self {
            tools: tools.to_vec(),
            ..Self::default()
        }
    }
}

pub struct FakeSession {
    integration: String,
    connection_id: Uuid,
    server: FakeServer,
    pub access_token: String,
    pub closed: AtomicBool,
    pub close_calls: AtomicUsize,
}

#[async_trait]
impl ToolSession for FakeSession {
    fn integration(&self) -> &str {
        &self.integration
    }

    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, BrokerError> {
        if self.server.hang_list {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.server.fail_list {
            return Err(BrokerError::DiscoveryFailed("tools/list failed: 500".into()));
        }
        Ok(self
            .server
            .tools
            .iter()
            .map(|name| ToolDefinition {
                name: name.to_string(),
                description: Some(format!("{name} on {}", self.integration)),
                input_schema: json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, BrokerError> {
        Ok(json!({
            "integration": self.integration,
            "tool": name,
            "arguments": arguments,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Session factory keyed by integration name.
#[derive(Default)]
pub struct FakeSessionFactory {
    servers: HashMap<String, FakeServer>,
    pub opened: Mutex<Vec<Arc<FakeSession>>>,
    pub open_attempts: AtomicUsize,
}

impl FakeSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, integration: &str, server: FakeServer) -> Self {
        self.servers.insert(integration.into(), server);
        self
    }

    pub fn opened(&self) -> Vec<Arc<FakeSession>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn all_closed(&self) -> bool {
        self.opened()
            .iter()
            .all(|s| s.closed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open_session(
        &self,
        connection: &Connection,
        integration: &IntegrationDescriptor,
        access_token: &str,
    ) -> Result<Arc<dyn ToolSession>, BrokerError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if resolve_server_url(connection, integration).is_none() {
            return Err(BrokerError::SessionUnavailable("no address".into()));
        }
        let server = self
            .servers
            .get(&integration.name)
            .cloned()
            .unwrap_or_default();
        if server.hang_open {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if server.fail_open {
            return Err(BrokerError::SessionUnavailable(format!(
                "{} refused the handshake",
                integration.name
            )));
        }
        let session = Arc::new(FakeSession {
            integration: integration.name.clone(),
            connection_id: connection.id,
            server,
            access_token: access_token.to_string(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        self.opened.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub fn store() -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::new())
}

pub async fn stored(store: &MemoryCredentialStore, id: Uuid) -> Connection {
    store
        .get_connection(id)
        .await
        .expect("store read")
        .expect("connection exists")
}
