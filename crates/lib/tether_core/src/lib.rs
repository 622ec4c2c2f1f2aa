//! # tether_core
//!
//! Tool connection and credential broker for Tether.
//!
//! Keeps each user's per-integration OAuth credentials valid, opens one
//! authenticated MCP session per active connection, and merges the tools the
//! user enabled into a single surface for the agent runtime.

pub mod config;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod uuid;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
