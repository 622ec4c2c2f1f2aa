//! Tool aggregation.
//!
//! Builds the per-turn tool surface for a user: every eligible connection
//! runs its own pipeline (credential, session, discovery, filter)
//! concurrently, and the survivors are merged in the store's stable order.
//! A failing connection only removes its own tools from the surface.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::BrokerError;
use super::lifecycle::{self, DEFAULT_CLOSE_TIMEOUT};
use super::session::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCOVERY_TIMEOUT, SessionFactory, ToolDefinition, ToolSession,
    resolve_server_url,
};
use super::store::CredentialStore;
use super::token_broker::TokenBroker;
use crate::models::connection::ConnectionWithGrants;
use crate::models::integration::{AuthType, IntegrationDescriptor};

/// Separator between integration and tool in prefixed names.
pub const PREFIX_DELIMITER: &str = "__";

// =============================================================================
// Naming policy
// =============================================================================

/// How remote tool names map to exposed names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolNaming {
    /// Exposed name is the remote name. On collision the connection that
    /// sorts later wins.
    #[default]
    Bare,
    /// Exposed name is `<integration>__<tool>`.
    Prefixed,
}

impl ToolNaming {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bare => "bare",
            Self::Prefixed => "prefixed",
        }
    }

    pub fn exposed_name(&self, integration: &str, tool: &str) -> String {
        match self {
            Self::Bare => tool.to_string(),
            Self::Prefixed => format!("{integration}{PREFIX_DELIMITER}{tool}"),
        }
    }
}

impl FromStr for ToolNaming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bare" => Ok(Self::Bare),
            "prefixed" => Ok(Self::Prefixed),
            other => Err(format!("unknown tool naming policy: {other}")),
        }
    }
}

// =============================================================================
// Tool surface
// =============================================================================

/// One exposed tool and the session that serves it.
#[derive(Clone)]
pub struct ToolHandle {
    pub exposed_name: String,
    pub integration: String,
    pub connection_id: Uuid,
    pub remote_name: String,
    pub definition: ToolDefinition,
    session: Arc<dyn ToolSession>,
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("exposed_name", &self.exposed_name)
            .field("integration", &self.integration)
            .field("connection_id", &self.connection_id)
            .field("remote_name", &self.remote_name)
            .finish_non_exhaustive()
    }
}

/// The merged tools for one turn plus every session that must be closed.
pub struct ToolSurface {
    tools: BTreeMap<String, ToolHandle>,
    sessions: Vec<Arc<dyn ToolSession>>,
    close_timeout: Duration,
}

impl ToolSurface {
    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
            sessions: Vec::new(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn tools(&self) -> &BTreeMap<String, ToolHandle> {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandle> {
        self.tools.get(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn sessions(&self) -> &[Arc<dyn ToolSession>] {
        &self.sessions
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Invoke an exposed tool through its owning session.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, BrokerError> {
        let handle = self
            .tools
            .get(name)
            .ok_or_else(|| BrokerError::UnknownTool(name.to_string()))?;
        debug!(
            tool = %name,
            integration = %handle.integration,
            connection_id = %handle.connection_id,
            "Dispatching tool call"
        );
        handle.session.call_tool(&handle.remote_name, arguments).await
    }

    /// Close every session of this turn.
    pub async fn close(self) {
        lifecycle::close_all(&self.sessions, self.close_timeout).await;
    }
}

// =============================================================================
// Per-connection pipeline
// =============================================================================

/// Why a connection contributed nothing.
#[derive(Debug)]
enum SkipReason {
    UnknownIntegration,
    UnsupportedAuth(AuthType),
    NoServerAddress,
    Credential(BrokerError),
    Session(BrokerError),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownIntegration => f.write_str("integration not in registry"),
            Self::UnsupportedAuth(auth) => write!(f, "auth type {auth} is not aggregated"),
            Self::NoServerAddress => f.write_str("no server address"),
            Self::Credential(e) => write!(f, "credential unavailable: {e}"),
            Self::Session(e) => write!(f, "session unavailable: {e}"),
        }
    }
}

enum PipelineOutcome {
    /// Session opened and discovery succeeded; `tools` is already filtered.
    Ready {
        session: Arc<dyn ToolSession>,
        tools: Vec<ToolDefinition>,
    },
    /// Session opened but discovery failed. The session still needs closing.
    Undiscovered {
        session: Arc<dyn ToolSession>,
        error: BrokerError,
    },
    Skipped(SkipReason),
    Cancelled(Option<Arc<dyn ToolSession>>),
}

impl PipelineOutcome {
    fn into_session(self) -> Option<Arc<dyn ToolSession>> {
        match self {
            Self::Ready { session, .. } | Self::Undiscovered { session, .. } => Some(session),
            Self::Cancelled(session) => session,
            Self::Skipped(_) => None,
        }
    }
}

/// Tool names a connection may expose: enabled grants on the allow-list.
fn enabled_tools(entry: &ConnectionWithGrants, descriptor: &IntegrationDescriptor) -> BTreeSet<String> {
    entry
        .grants
        .iter()
        .filter(|g| g.is_enabled && descriptor.allows_tool(&g.tool_name))
        .map(|g| g.tool_name.clone())
        .collect()
}

// =============================================================================
// Aggregator
// =============================================================================

pub struct ToolAggregator {
    store: Arc<dyn CredentialStore>,
    broker: Arc<TokenBroker>,
    factory: Arc<dyn SessionFactory>,
    naming: ToolNaming,
    connect_timeout: Duration,
    discovery_timeout: Duration,
    close_timeout: Duration,
}

impl ToolAggregator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        broker: Arc<TokenBroker>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            store,
            broker,
            factory,
            naming: ToolNaming::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_naming(mut self, naming: ToolNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Bound session open and tool discovery per connection, whatever the
    /// factory does internally.
    pub fn with_pipeline_timeouts(mut self, connect: Duration, discovery: Duration) -> Self {
        self.connect_timeout = connect;
        self.discovery_timeout = discovery;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn naming(&self) -> ToolNaming {
        self.naming
    }

    /// Build the tool surface for one turn.
    pub async fn build_tool_surface(&self, user_id: &str) -> Result<ToolSurface, BrokerError> {
        self.build_tool_surface_with_cancel(user_id, &CancellationToken::new())
            .await
    }

    /// Build the tool surface, abandoning session opens and discovery when
    /// `cancel` fires. Sessions already opened are closed before returning
    /// `Cancelled`.
    pub async fn build_tool_surface_with_cancel(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolSurface, BrokerError> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        let eligible = self
            .store
            .list_active_connections_with_enabled_tools(user_id)
            .await?;
        if eligible.is_empty() {
            debug!(user_id, "No eligible connections");
            return Ok(self.surface(BTreeMap::new(), Vec::new()));
        }

        let outcomes = join_all(eligible.iter().map(|entry| self.run_pipeline(entry, cancel))).await;

        if cancel.is_cancelled() {
            let sessions: Vec<_> = outcomes
                .into_iter()
                .filter_map(PipelineOutcome::into_session)
                .collect();
            info!(user_id, open_sessions = sessions.len(), "Tool surface build cancelled");
            lifecycle::close_all(&sessions, self.close_timeout).await;
            return Err(BrokerError::Cancelled);
        }

        let mut tools: BTreeMap<String, ToolHandle> = BTreeMap::new();
        let mut sessions = Vec::new();
        for outcome in outcomes {
            match outcome {
                PipelineOutcome::Ready { session, tools: defs } => {
                    for definition in defs {
                        self.merge(&mut tools, &session, definition);
                    }
                    sessions.push(session);
                }
                PipelineOutcome::Undiscovered { session, .. } => sessions.push(session),
                PipelineOutcome::Cancelled(session) => sessions.extend(session),
                PipelineOutcome::Skipped(_) => {}
            }
        }

        info!(
            user_id,
            connections = eligible.len(),
            sessions = sessions.len(),
            tools = tools.len(),
            "Built tool surface"
        );
        Ok(self.surface(tools, sessions))
    }

    fn surface(
        &self,
        tools: BTreeMap<String, ToolHandle>,
        sessions: Vec<Arc<dyn ToolSession>>,
    ) -> ToolSurface {
        ToolSurface {
            tools,
            sessions,
            close_timeout: self.close_timeout,
        }
    }

    fn merge(
        &self,
        tools: &mut BTreeMap<String, ToolHandle>,
        session: &Arc<dyn ToolSession>,
        definition: ToolDefinition,
    ) {
        let integration = session.integration().to_string();
        let exposed_name = self.naming.exposed_name(&integration, &definition.name);
        let handle = ToolHandle {
            exposed_name: exposed_name.clone(),
            integration,
            connection_id: session.connection_id(),
            remote_name: definition.name.clone(),
            definition,
            session: Arc::clone(session),
        };
        if let Some(previous) = tools.insert(exposed_name.clone(), handle) {
            warn!(
                tool = %exposed_name,
                replaced_integration = %previous.integration,
                replaced_connection_id = %previous.connection_id,
                integration = %session.integration(),
                connection_id = %session.connection_id(),
                "Tool name collision; later connection wins"
            );
        }
    }

    async fn run_pipeline(
        &self,
        entry: &ConnectionWithGrants,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let connection = &entry.connection;
        let outcome = self.pipeline(entry, cancel).await;
        match &outcome {
            PipelineOutcome::Skipped(reason) => warn!(
                integration = %connection.integration_name,
                connection_id = %connection.id,
                "Skipping connection: {reason}"
            ),
            PipelineOutcome::Undiscovered { error, .. } => warn!(
                integration = %connection.integration_name,
                connection_id = %connection.id,
                "Tool discovery failed: {error}"
            ),
            PipelineOutcome::Ready { tools, .. } => debug!(
                integration = %connection.integration_name,
                connection_id = %connection.id,
                tools = tools.len(),
                "Connection ready"
            ),
            PipelineOutcome::Cancelled(_) => {}
        }
        outcome
    }

    async fn pipeline(&self, entry: &ConnectionWithGrants, cancel: &CancellationToken) -> PipelineOutcome {
        let connection = &entry.connection;

        let Some(descriptor) = self.broker.registry().lookup(&connection.integration_name) else {
            return PipelineOutcome::Skipped(SkipReason::UnknownIntegration);
        };
        if descriptor.auth_type != AuthType::OAuth {
            return PipelineOutcome::Skipped(SkipReason::UnsupportedAuth(descriptor.auth_type));
        }
        if resolve_server_url(connection, descriptor).is_none() {
            return PipelineOutcome::Skipped(SkipReason::NoServerAddress);
        }

        // Not cancellable: a rotated token must always be persisted.
        let access_token = match self.broker.ensure_valid_access_token(connection).await {
            Ok(token) => token,
            Err(e) => return PipelineOutcome::Skipped(SkipReason::Credential(e)),
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PipelineOutcome::Cancelled(None),
            opened = tokio::time::timeout(
                self.connect_timeout,
                self.factory.open_session(connection, descriptor, &access_token),
            ) => opened.unwrap_or_else(|_| {
                Err(BrokerError::SessionUnavailable(format!(
                    "Session open timed out ({}s)",
                    self.connect_timeout.as_secs()
                )))
            }),
        };
        let session = match opened {
            Ok(session) => session,
            Err(e) => return PipelineOutcome::Skipped(SkipReason::Session(e)),
        };

        let discovering = Arc::clone(&session);
        let discovered = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PipelineOutcome::Cancelled(Some(session)),
            discovered = tokio::time::timeout(self.discovery_timeout, discovering.list_tools()) => {
                discovered.unwrap_or_else(|_| {
                    Err(BrokerError::DiscoveryFailed(format!(
                        "Tool discovery timed out ({}s)",
                        self.discovery_timeout.as_secs()
                    )))
                })
            }
        };
        let catalog = match discovered {
            Ok(catalog) => catalog,
            Err(error) => return PipelineOutcome::Undiscovered { session, error },
        };

        let enabled = enabled_tools(entry, descriptor);
        let tools = catalog
            .into_iter()
            .filter(|t| enabled.contains(&t.name))
            .collect();
        PipelineOutcome::Ready { session, tools }
    }
}
