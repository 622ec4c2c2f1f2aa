use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{}", .0)]
    Custom(String),

    #[error("Config: {}", .0)]
    Config(#[from] tether_core::config::ConfigError),

    #[error("Registry: {}", .0)]
    Registry(#[from] tether_core::mcp::registry::RegistryError),

    #[error("{}", .0)]
    Broker(#[from] tether_core::mcp::BrokerError),

    #[error("Database: {}", .0)]
    Db(#[from] sqlx::Error),

    #[error("Migration: {}", .0)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Json: {}", .0)]
    Json(#[from] serde_json::Error),
}
