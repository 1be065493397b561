//! # Cascade
//!
//! Realtime message server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! cascade
//!
//! # Run with environment variables
//! CASCADE_PORT=8000 CASCADE_HOST=0.0.0.0 cascade
//! ```
//!
//! Configuration is read from `cascade.toml` when present.

use anyhow::Result;
use cascade_server::{Config, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Cascade server on {}:{}", config.host, config.port);

    // Initialize metrics
    cascade_server::metrics::init_metrics();

    // Start the server
    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
