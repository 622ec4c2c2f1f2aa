//! Integration registry.
//!
//! Immutable catalog of the tool servers users can connect to. Built once at
//! startup (built-in catalog or a YAML file) and shared behind an `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use thiserror::Error;

use crate::models::integration::{AuthType, IntegrationDescriptor, OAuthEndpoints};

/// Registry construction errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate integration name: {0}")]
    DuplicateName(String),

    #[error("Integration {0} has an empty name")]
    EmptyName(String),

    #[error("OAuth integration {0} has no token endpoint")]
    MissingTokenEndpoint(String),

    #[error("Failed to read registry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse registry file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Read-only catalog of integration descriptors keyed by name.
#[derive(Debug, Clone)]
pub struct IntegrationRegistry {
    integrations: BTreeMap<String, IntegrationDescriptor>,
}

impl IntegrationRegistry {
    /// Build a registry, validating catalog invariants.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = IntegrationDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut integrations = BTreeMap::new();
        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(RegistryError::EmptyName(descriptor.display_name));
            }
            if descriptor.auth_type == AuthType::OAuth && descriptor.token_endpoint().is_none() {
                return Err(RegistryError::MissingTokenEndpoint(descriptor.name));
            }
            if integrations.contains_key(&descriptor.name) {
                return Err(RegistryError::DuplicateName(descriptor.name));
            }
            integrations.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self { integrations })
    }

    /// Parse a YAML list of descriptors.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        let descriptors: Vec<IntegrationDescriptor> = serde_yaml::from_str(yaml)?;
        Self::from_descriptors(descriptors)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, RegistryError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Look up an integration by name. `None` means unknown or removed.
    pub fn lookup(&self, name: &str) -> Option<&IntegrationDescriptor> {
        self.integrations.get(name)
    }

    /// All integrations in name order, including coming-soon ones.
    pub fn iter(&self) -> impl Iterator<Item = &IntegrationDescriptor> {
        self.integrations.values()
    }

    /// Integrations users may activate (excludes coming-soon).
    pub fn available(&self) -> impl Iterator<Item = &IntegrationDescriptor> {
        self.iter().filter(|d| !d.coming_soon)
    }

    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }

    /// The built-in catalog.
    pub fn builtin() -> Self {
        let integrations = builtin_descriptors()
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { integrations }
    }
}

fn strings(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn oauth(authorize: &str, token: &str, register: Option<&str>) -> Option<OAuthEndpoints> {
    Some(OAuthEndpoints {
        authorization_endpoint: authorize.to_string(),
        token_endpoint: token.to_string(),
        registration_endpoint: register.map(str::to_string),
    })
}

fn builtin_descriptors() -> Vec<IntegrationDescriptor> {
    vec![
        IntegrationDescriptor {
            name: "notion".into(),
            display_name: "Notion".into(),
            auth_type: AuthType::OAuth,
            server_url: Some("https://mcp.notion.com/mcp".into()),
            scopes: strings(&["read"]),
            allowed_tools: strings(&["notion-search", "notion-fetch"]),
            oauth_config: oauth(
                "https://mcp.notion.com/authorize",
                "https://mcp.notion.com/token",
                Some("https://mcp.notion.com/register"),
            ),
            coming_soon: false,
        },
        IntegrationDescriptor {
            name: "stripe".into(),
            display_name: "Stripe".into(),
            auth_type: AuthType::OAuth,
            server_url: Some("https://mcp.stripe.com".into()),
            scopes: BTreeSet::new(),
            allowed_tools: strings(&[
                "list_customers",
                "list_disputes",
                "list_invoices",
                "list_payment_intents",
                "list_prices",
                "list_products",
                "list_subscriptions",
            ]),
            oauth_config: oauth(
                "https://marketplace.stripe.com/oauth/v2/authorize",
                "https://marketplace.stripe.com/oauth/v2/token",
                Some(
                    "https://marketplace.stripe.com/oauth/v2/register/tailorapp%2AAZfBZ6Q69QAAADJI%23EhcKFWFjY3RfMVJlaTA0QUo4QktoWGxzQw",
                ),
            ),
            coming_soon: false,
        },
        IntegrationDescriptor {
            name: "monday".into(),
            display_name: "Monday.com".into(),
            auth_type: AuthType::OAuth,
            server_url: Some("https://mcp.monday.com".into()),
            scopes: strings(&["read", "write"]),
            allowed_tools: strings(&[
                "get_board_items_by_name",
                "get_board_info",
                "list_users_and_teams",
                "workspace_info",
                "list_workspaces",
            ]),
            oauth_config: oauth(
                "https://mcp.monday.com/authorize",
                "https://mcp.monday.com/token",
                Some("https://mcp.monday.com/register"),
            ),
            coming_soon: true,
        },
        IntegrationDescriptor {
            name: "hubspot".into(),
            display_name: "HubSpot".into(),
            auth_type: AuthType::OAuth,
            server_url: Some("https://mcp.hubspot.com/".into()),
            scopes: strings(&[
                "content",
                "crm.objects.companies.read",
                "crm.objects.companies.write",
                "crm.objects.contacts.read",
                "crm.objects.contacts.write",
                "crm.objects.deals.write",
                "forms",
                "oauth",
                "timeline",
            ]),
            allowed_tools: BTreeSet::new(),
            // HubSpot does not support dynamic registration.
            oauth_config: oauth(
                "https://mcp.hubspot.com/oauth/authorize/user",
                "https://mcp.hubspot.com/oauth/v1/token",
                None,
            ),
            coming_soon: true,
        },
    ]
}
