//! Integration descriptor models.
//!
//! These describe the tool servers a user can connect to. Descriptors are
//! loaded once into the [`IntegrationRegistry`](crate::mcp::registry::IntegrationRegistry)
//! and never mutated afterwards.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// How a user authenticates against an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    #[serde(rename = "oauth")]
    OAuth,
    ApiToken,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OAuth => "oauth",
            Self::ApiToken => "api-token",
        }
    }
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Descriptor types
// =============================================================================

/// OAuth endpoints for an integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthEndpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    /// Dynamic client registration endpoint. Registration itself happens
    /// outside the broker; only its result (`registered_server_url`) is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
}

/// Catalog entry for one integrable tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationDescriptor {
    pub name: String,
    pub display_name: String,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    /// Tools this integration may expose, regardless of user grants.
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_config: Option<OAuthEndpoints>,
    #[serde(default)]
    pub coming_soon: bool,
}

impl IntegrationDescriptor {
    /// Whether `tool_name` is on this integration's allow-list.
    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.allowed_tools.contains(tool_name)
    }

    /// Token endpoint, if this is an OAuth integration with one configured.
    pub fn token_endpoint(&self) -> Option<&str> {
        self.oauth_config
            .as_ref()
            .map(|c| c.token_endpoint.as_str())
            .filter(|e| !e.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_type_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&AuthType::OAuth).unwrap(), "\"oauth\"");
        assert_eq!(
            serde_json::to_string(&AuthType::ApiToken).unwrap(),
            "\"api-token\""
        );
        let parsed: AuthType = serde_json::from_str("\"api-token\"").unwrap();
        assert_eq!(parsed, AuthType::ApiToken);
    }

    #[test]
    fn descriptor_defaults_optional_fields() {
        let d: IntegrationDescriptor = serde_json::from_value(serde_json::json!({
            "name": "docs",
            "displayName": "Docs",
            "authType": "api-token",
        }))
        .unwrap();
        assert!(d.allowed_tools.is_empty());
        assert!(d.oauth_config.is_none());
        assert!(!d.coming_soon);
        assert!(d.token_endpoint().is_none());
    }

    #[test]
    fn blank_token_endpoint_is_treated_as_missing() {
        let d = IntegrationDescriptor {
            name: "x".into(),
            display_name: "X".into(),
            auth_type: AuthType::OAuth,
            server_url: None,
            scopes: BTreeSet::new(),
            allowed_tools: BTreeSet::new(),
            oauth_config: Some(OAuthEndpoints {
                authorization_endpoint: "https://x.test/authorize".into(),
                token_endpoint: "  ".into(),
                registration_endpoint: None,
            }),
            coming_soon: false,
        };
        assert!(d.token_endpoint().is_none());
    }
}
