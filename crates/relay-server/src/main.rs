//! # Relay Server
//!
//! Fan-out message relay: anything posted to `/send` or `/file` is streamed
//! to every open `/receive` response as newline-delimited JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with a specific config file
//! RELAY_CONFIG=/path/to/relay.toml relay
//!
//! # Run with environment variables
//! RELAY_PORT=8080 RELAY_FILE_SIZE_LIMIT=0 relay
//! ```

mod config;
mod error;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let default_filter = if std::env::var("RELAY_DEBUG").is_ok_and(|v| !v.is_empty()) {
        "relay=debug"
    } else {
        "relay=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::var_os(config::CONFIG_PATH_ENV) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
