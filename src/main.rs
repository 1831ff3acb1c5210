use anyhow::Result;
use tracing::info;

use tlstrap::{server, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr; the audit trail has its own sink
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    info!(bind = %config.bind_addr(), "Configuration loaded");

    server::run(config).await
}
