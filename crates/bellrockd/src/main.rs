//! bellrockd - Bellrock anonymous beacon resolution daemon
//!
//! Registers devices, ingests peer edges and location history, and resolves
//! the anonymous IDs reported by observers.

use bellrockd::config::Config;
use bellrockd::server::Server;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("bellrockd=info".parse().unwrap()))
        .init();

    // Parse and validate configuration
    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "bellrockd v{} - anonymous beacon resolution daemon",
        env!("CARGO_PKG_VERSION")
    );

    match Server::new(config) {
        Ok(server) => {
            let shutdown = server.shutdown_handle();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("received shutdown signal");
                let _ = shutdown.send(());
            });

            if let Err(e) = server.run().await {
                error!("server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
