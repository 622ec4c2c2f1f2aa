//! Tether CLI.
//!
//! Drives the broker against the configured PostgreSQL database: manage
//! connections and grants, inspect a user's tool surface, and call tools.

pub use self::error::{Error, Result};
mod error;

use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use cli::{Cli, Commands};
use tether_core::config::{BrokerConfig, static_credentials_from_env};
use tether_core::mcp::aggregator::ToolAggregator;
use tether_core::mcp::connections::{self, ConnectRequest};
use tether_core::mcp::disconnect::{DisconnectOutcome, disconnect};
use tether_core::mcp::oauth::HttpTokenRefresher;
use tether_core::mcp::registry::IntegrationRegistry;
use tether_core::mcp::secrets::TokenCipher;
use tether_core::mcp::session::RmcpSessionFactory;
use tether_core::mcp::store::{CredentialStore, PgCredentialStore};
use tether_core::mcp::token_broker::TokenBroker;
use tether_core::models::connection::ConnectionView;

mod cli;
mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let args = Cli::parse();

    let mut config = BrokerConfig::from_env()?;
    config.database_url = args.database_url.clone();
    let registry = Arc::new(config.load_registry()?);

    if let Commands::Integrations { all } = &args.command {
        return print_integrations(&registry, *all);
    }

    info!(max_connections = args.max_connections, "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;

    if let Commands::Migrate = &args.command {
        info!("running database migrations");
        tether_core::migrate::migrate(&pool).await?;
        println!("migrations applied");
        return Ok(());
    }

    let cipher = TokenCipher::new(&config.encryption_key)?;
    let store: Arc<dyn CredentialStore> = Arc::new(PgCredentialStore::new(pool, cipher));

    match args.command {
        Commands::Migrate | Commands::Integrations { .. } => Ok(()),

        Commands::Connections { user } => {
            let rows = connections::list_connections(store.as_ref(), &user).await?;
            let views: Vec<ConnectionView> = rows.iter().map(ConnectionView::from).collect();
            println!("{}", serde_json::to_string_pretty(&views)?);
            Ok(())
        }

        Commands::Connect {
            user,
            integration,
            access_token,
            refresh_token,
            expires_in,
            server_url,
        } => {
            let request = ConnectRequest {
                user_id: user,
                integration_name: integration,
                access_token,
                refresh_token,
                expires_in,
                registered_server_url: server_url,
            };
            let conn = connections::connect(store.as_ref(), &registry, request).await?;
            println!("{}", serde_json::to_string_pretty(&ConnectionView::from(&conn))?);
            Ok(())
        }

        Commands::Grant {
            user,
            integration,
            tool,
            disable,
        } => {
            let grant = connections::set_tool_grant(
                store.as_ref(),
                &registry,
                &user,
                &integration,
                &tool,
                !disable,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&grant)?);
            Ok(())
        }

        Commands::Activate {
            user,
            integration,
            off,
        } => {
            let conn =
                connections::set_active(store.as_ref(), &registry, &user, &integration, !off)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&ConnectionView::from(&conn))?);
            Ok(())
        }

        Commands::Tools { user } => {
            let aggregator = build_aggregator(&config, store, registry);
            let surface = aggregator.build_tool_surface(&user).await?;
            for handle in surface.tools().values() {
                let description = handle.definition.description.as_deref().unwrap_or("");
                println!("{}\t{}\t{}", handle.exposed_name, handle.integration, description);
            }
            surface.close().await;
            Ok(())
        }

        Commands::Call { user, tool, args } => {
            let arguments = parse_arguments(args.as_deref())?;
            let aggregator = build_aggregator(&config, store, registry);
            let surface = aggregator.build_tool_surface(&user).await?;
            let result = surface.call_tool(&tool, arguments).await;
            surface.close().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
            Ok(())
        }

        Commands::Disconnect { user, integration } => {
            match disconnect(store.as_ref(), &registry, &user, &integration).await? {
                DisconnectOutcome::Disconnected { connection_id } => {
                    println!("disconnected {integration} ({connection_id})");
                }
                DisconnectOutcome::NotConnected => println!("{integration} was not connected"),
            }
            Ok(())
        }
    }
}

fn build_aggregator(
    config: &BrokerConfig,
    store: Arc<dyn CredentialStore>,
    registry: Arc<IntegrationRegistry>,
) -> ToolAggregator {
    let credentials = static_credentials_from_env(&registry);
    let broker = TokenBroker::new(store.clone(), registry, Arc::new(HttpTokenRefresher::new()))
        .with_credentials(credentials)
        .with_leeway(config.refresh_leeway_chrono())
        .with_refresh_timeout(config.refresh_timeout);
    let factory = RmcpSessionFactory::new().with_timeouts(
        config.connect_timeout,
        config.discovery_timeout,
        config.call_timeout,
    );
    ToolAggregator::new(store, Arc::new(broker), Arc::new(factory))
        .with_naming(config.tool_naming)
        .with_pipeline_timeouts(config.connect_timeout, config.discovery_timeout)
        .with_close_timeout(config.close_timeout)
}

fn print_integrations(registry: &IntegrationRegistry, all: bool) -> Result<()> {
    let descriptors: Vec<_> = if all {
        registry.iter().collect()
    } else {
        registry.available().collect()
    };
    println!("{}", serde_json::to_string_pretty(&descriptors)?);
    Ok(())
}

fn parse_arguments(raw: Option<&str>) -> Result<Option<serde_json::Map<String, Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(Some(map)),
        other => Err(Error::Custom(format!(
            "--args must be a JSON object, got {other}"
        ))),
    }
}
