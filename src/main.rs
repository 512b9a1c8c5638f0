//! Ingest Server
//!
//! Opens the metadata store and blob backend, then runs the upload
//! session janitor until shutdown.

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingest_server::{Config, IngestContext, IngestService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ingest_server=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Invalid configuration")?;

    tracing::info!("Starting Ingest Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        direct_upload_max_bytes = config.ingest.direct_upload_max_bytes,
        retention_hours = config.ingest.session_retention_hours,
        "Ingest limits"
    );

    let ctx = IngestContext::connect(config)
        .await
        .context("Failed to initialize ingest context")?;
    let service = IngestService::new(ctx);

    let shutdown = CancellationToken::new();
    let janitor = service.start_janitor(shutdown.clone());

    shutdown_signal().await;
    shutdown.cancel();
    janitor.await.context("Janitor task panicked")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
