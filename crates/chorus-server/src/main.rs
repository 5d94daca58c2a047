//! # Chorus Server
//!
//! Presence-aware group chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chorus
//!
//! # Run with a specific config file
//! CHORUS_CONFIG=/path/to/chorus.toml chorus
//!
//! # Run with environment variables
//! CHORUS_PORT=8080 CHORUS_HOST=0.0.0.0 chorus
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        groups = config.groups.len(),
        "Starting Chorus server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
