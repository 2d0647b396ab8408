//! # Outreach Edge - Main Entry Point
//!
//! Loads configuration, installs logging, builds the application context and
//! serves until ctrl-c or SIGTERM.

use anyhow::Context;
use outreach_edge::observability::init_logging;
use outreach_edge::{AppContext, EdgeConfig, EdgeServer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EdgeConfig::load().await.context("failed to load configuration")?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting outreach edge");

    let context = AppContext::build(config)
        .await
        .context("failed to build application context")?;
    let server = EdgeServer::new(context).context("failed to assemble server")?;

    if let Err(e) = server.run().await {
        error!(error = %e, "Edge server terminated with an error");
        return Err(e.into());
    }

    info!("Outreach edge shutdown complete");
    Ok(())
}
