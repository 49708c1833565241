//! # Relay
//!
//! Chat relay server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (requests on 5556, subscribers on 5558)
//! relay
//!
//! # Run with environment overrides
//! RELAY_REQUEST_PORT=6000 RELAY_DATA_DIR=/var/lib/relay relay
//! ```

use anyhow::Result;
use relay_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,relay_server=debug,relay_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!(
        "Starting relay: requests on {}:{}, subscribers on {}:{}, data in {}",
        config.host,
        config.request_port,
        config.host,
        config.subscribe_port,
        config.data_dir.display()
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
