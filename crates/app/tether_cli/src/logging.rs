use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tether_core=debug";

/// Logs go to stderr; stdout carries command output.
pub fn init() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();
}
