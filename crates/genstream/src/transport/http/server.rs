//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::service::GenerationService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Serve until SIGINT/SIGTERM or until the service's shutdown token fires.
pub async fn serve(config: ServerConfig, service: Arc<GenerationService>) -> anyhow::Result<()> {
    let app = routes(service.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting genstream server on {}", actual_addr);

    let janitor = service.spawn_janitor();
    let shutdown = service.shutdown_token();
    let signal_service = service.clone();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown).await;
            // Ends open streams so the drain does not wait on them.
            signal_service.shutdown();
        })
        .await?;

    service.shutdown();
    let _ = janitor.await;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or an in-process shutdown request.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested...");
        }
    }
}
