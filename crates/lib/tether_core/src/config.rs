//! Broker configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::mcp::aggregator::ToolNaming;
use crate::mcp::oauth::{ClientCredentials, StaticCredentials};
use crate::mcp::registry::{IntegrationRegistry, RegistryError};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("TETHER_TOOL_NAMING: {0}")]
    InvalidNaming(String),
}

/// Configuration for the broker and its adapters.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Passphrase for token encryption at rest.
    pub encryption_key: String,
    /// YAML integration catalog. `None` selects the built-in catalog.
    pub registry_path: Option<PathBuf>,
    pub tool_naming: ToolNaming,
    /// Tokens expiring within this margin are refreshed early.
    pub refresh_leeway: Duration,
    pub refresh_timeout: Duration,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    pub call_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/tether".into(),
            encryption_key: "tether-default-dev-key-change-in-production".into(),
            registry_path: None,
            tool_naming: ToolNaming::Bare,
            refresh_leeway: Duration::ZERO,
            refresh_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Reads configuration from environment variables.
    ///
    /// | Variable                        | Default                            |
    /// |---------------------------------|------------------------------------|
    /// | `DATABASE_URL`                  | `postgres://localhost:5432/tether` |
    /// | `TETHER_ENCRYPTION_KEY`         | dev-only default                   |
    /// | `TETHER_REGISTRY_PATH`          | built-in catalog                   |
    /// | `TETHER_TOOL_NAMING`            | `bare` (or `prefixed`)             |
    /// | `TETHER_REFRESH_LEEWAY_SECS`    | `0`                                |
    /// | `TETHER_REFRESH_TIMEOUT_SECS`   | `15`                               |
    /// | `TETHER_CONNECT_TIMEOUT_SECS`   | `15`                               |
    /// | `TETHER_DISCOVERY_TIMEOUT_SECS` | `30`                               |
    /// | `TETHER_CALL_TIMEOUT_SECS`      | `30`                               |
    /// | `TETHER_CLOSE_TIMEOUT_SECS`     | `5`                                |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidNumber { var, value }),
            }
        };

        let refresh_leeway = secs("TETHER_REFRESH_LEEWAY_SECS", defaults.refresh_leeway)?;
        if chrono::Duration::from_std(refresh_leeway).is_err() {
            return Err(ConfigError::InvalidNumber {
                var: "TETHER_REFRESH_LEEWAY_SECS",
                value: refresh_leeway.as_secs().to_string(),
            });
        }

        let tool_naming = match get("TETHER_TOOL_NAMING") {
            None => defaults.tool_naming,
            Some(v) => v.parse::<ToolNaming>().map_err(ConfigError::InvalidNaming)?,
        };

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            encryption_key: get("TETHER_ENCRYPTION_KEY").unwrap_or(defaults.encryption_key),
            registry_path: get("TETHER_REGISTRY_PATH").map(PathBuf::from),
            tool_naming,
            refresh_leeway,
            refresh_timeout: secs("TETHER_REFRESH_TIMEOUT_SECS", defaults.refresh_timeout)?,
            connect_timeout: secs("TETHER_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            discovery_timeout: secs("TETHER_DISCOVERY_TIMEOUT_SECS", defaults.discovery_timeout)?,
            call_timeout: secs("TETHER_CALL_TIMEOUT_SECS", defaults.call_timeout)?,
            close_timeout: secs("TETHER_CLOSE_TIMEOUT_SECS", defaults.close_timeout)?,
        })
    }

    /// Load the configured catalog, or the built-in one.
    pub fn load_registry(&self) -> Result<IntegrationRegistry, RegistryError> {
        match &self.registry_path {
            Some(path) => IntegrationRegistry::from_yaml_file(path),
            None => Ok(IntegrationRegistry::builtin()),
        }
    }

    /// Refresh leeway as a chrono duration for expiry arithmetic.
    pub fn refresh_leeway_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_leeway).unwrap_or(chrono::Duration::zero())
    }
}

/// Env-var prefix for an integration's static client credentials,
/// e.g. `TETHER_NOTION`.
pub fn credentials_prefix(integration: &str) -> String {
    let name: String = integration
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("TETHER_{name}")
}

/// Static client credentials from `TETHER_<INTEGRATION>_CLIENT_ID` and
/// `TETHER_<INTEGRATION>_CLIENT_SECRET`. Integrations without a client id get
/// no entry.
pub fn static_credentials_from_lookup(
    registry: &IntegrationRegistry,
    lookup: impl Fn(&str) -> Option<String>,
) -> StaticCredentials {
    let mut credentials = StaticCredentials::new();
    for descriptor in registry.iter() {
        let prefix = credentials_prefix(&descriptor.name);
        let Some(client_id) = lookup(&format!("{prefix}_CLIENT_ID")).filter(|v| !v.is_empty())
        else {
            continue;
        };
        let client_secret = lookup(&format!("{prefix}_CLIENT_SECRET")).filter(|v| !v.is_empty());
        credentials.insert(
            descriptor.name.clone(),
            ClientCredentials {
                client_id,
                client_secret,
            },
        );
    }
    credentials
}

pub fn static_credentials_from_env(registry: &IntegrationRegistry) -> StaticCredentials {
    static_credentials_from_lookup(registry, |key| std::env::var(key).ok())
}
