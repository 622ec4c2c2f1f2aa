use clap::{Parser, Subcommand};

/// Operator CLI for the Tether tool connection broker.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
pub struct Cli {
    /// PostgreSQL connection URL.
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/tether"
    )]
    pub database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, global = true, default_value_t = 5)]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run database migrations.
    Migrate,

    /// List integrations from the registry.
    Integrations {
        /// Include coming-soon integrations.
        #[arg(long)]
        all: bool,
    },

    /// List a user's connections.
    Connections {
        #[arg(long)]
        user: String,
    },

    /// Store credentials for a user's connection.
    Connect {
        #[arg(long)]
        user: String,
        #[arg(long)]
        integration: String,
        #[arg(long, env = "TETHER_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
        #[arg(long, hide_env_values = true)]
        refresh_token: Option<String>,
        /// Access token lifetime in seconds.
        #[arg(long)]
        expires_in: Option<i64>,
        /// Server address obtained from dynamic client registration.
        #[arg(long)]
        server_url: Option<String>,
    },

    /// Enable (or disable) one tool on a connection.
    Grant {
        #[arg(long)]
        user: String,
        #[arg(long)]
        integration: String,
        #[arg(long)]
        tool: String,
        #[arg(long)]
        disable: bool,
    },

    /// Activate (or deactivate) a connection.
    Activate {
        #[arg(long)]
        user: String,
        #[arg(long)]
        integration: String,
        #[arg(long)]
        off: bool,
    },

    /// Build the user's tool surface and print it.
    Tools {
        #[arg(long)]
        user: String,
    },

    /// Call one tool from the user's tool surface.
    Call {
        #[arg(long)]
        user: String,
        #[arg(long)]
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
    },

    /// Remove a connection and its tool grants.
    Disconnect {
        #[arg(long)]
        user: String,
        #[arg(long)]
        integration: String,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_grant_with_disable() {
        let cli = Cli::parse_from([
            "tether",
            "grant",
            "--user",
            "u",
            "--integration",
            "notion",
            "--tool",
            "notion-search",
            "--disable",
        ]);
        match cli.command {
            Commands::Grant { tool, disable, .. } => {
                assert_eq!(tool, "notion-search");
                assert!(disable);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
