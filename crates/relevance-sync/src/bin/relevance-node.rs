//! Relevance node binary entry point
//!
//! Runs a single-host node over an in-memory coordination ensemble and
//! serves the admin API.

use std::net::SocketAddr;
use std::sync::Arc;

use coordination::MemoryEnsemble;
use relevance_core::{logging, JsonModelCompiler, SyncConfig};
use relevance_sync::{http_api, RelevanceSync};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init("relevance_sync=info,dispatcher=info,model_store=info,coordination=info");

    // Optional config file path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(path = %path, "Loading configuration");
            SyncConfig::from_file(path)?
        }
        None => SyncConfig::default(),
    };
    let http_addr: SocketAddr = config.http.bind_address.parse()?;

    let ensemble = MemoryEnsemble::new();
    let sync = RelevanceSync::start(
        config,
        Arc::new(ensemble.connect()),
        Arc::new(JsonModelCompiler::new()),
    )
    .await?;

    let router = http_api::create_router(Arc::clone(&sync));
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("HTTP API listening on {}", http_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sync.shutdown().await;
    info!("Relevance node shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
