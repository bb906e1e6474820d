//! # Beacon
//!
//! Horizontally-scalable push server: long-lived WebSocket client
//! sessions, a third-party update endpoint, and inter-node routing so an
//! update landing anywhere reaches the node holding the client's socket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with a config file at ./beacon.toml
//! beacon
//!
//! # Run with environment overrides
//! BEACON_PORT=8080 BEACON_HOST=0.0.0.0 beacon
//! ```

mod config;
mod handlers;
mod metrics;
mod worker;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;
    tracing::info!(
        current_host = %config.current_host,
        version = env!("CARGO_PKG_VERSION"),
        "starting beacon"
    );

    metrics::init_metrics();

    let state = Arc::new(handlers::AppState::new(config)?);

    // Unwind everything on interrupt: listeners stop, workers disconnect,
    // the router and pool close.
    let interrupt_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            interrupt_state.close();
        }
    });

    handlers::run_server(state).await
}
