//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize subsystems in dependency order
//! - Start the metrics exporter when enabled
//! - Bind the listener and serve until a shutdown signal
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The listener binds last, after the backend set is known to be valid

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::{BalancerConfig, ConfigError};
use crate::http::HttpServer;
use crate::lifecycle::{shutdown_signal, Shutdown};
use crate::observability::metrics;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

/// Build the balancer from `config` and serve until SIGINT/SIGTERM.
pub async fn run(config: BalancerConfig) -> Result<(), StartupError> {
    let server = HttpServer::new(config)?;
    let observability = &server.config().observability;

    if observability.metrics_enabled {
        match observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(e) => tracing::error!(
                metrics_address = %observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let address = server.config().listener.bind_address.clone();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| StartupError::Bind { address, source })?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Arc::new(Shutdown::new());
    let receiver = shutdown.subscribe();
    tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move {
            shutdown_signal().await;
            shutdown.trigger();
        }
    });

    server.run(listener, receiver).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
