//! # Banter Server
//!
//! Realtime chat server: presence, rooms, private messages, typing
//! indicators, reactions, read receipts and history.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! banter
//!
//! # Run with a config file at ./banter.toml
//! banter
//!
//! # Run with environment variables
//! BANTER_PORT=8080 BANTER_HOST=0.0.0.0 banter
//! ```
//!
//! Clients connect to `ws://host:port/ws?token=...`. The bundled token
//! verifier is a development stand-in; production deployments plug a real
//! one in through [`auth::TokenVerifier`].

mod auth;
mod config;
mod gateway;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Banter server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    gateway::run_server(config, Box::new(auth::DevTokenVerifier)).await?;

    Ok(())
}
