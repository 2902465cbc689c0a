//! Resumable Upload Server
//!
//! Accepts large files in chunks over HTTP and streams them into an
//! S3-compatible bucket as multipart uploads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resumable_upload_server::config::{Config, StorageProvider};
use resumable_upload_server::routes;
use resumable_upload_server::state::AppState;
use resumable_upload_server::storage::{MemoryStorage, S3Client, StorageAdapter};
use resumable_upload_server::upload::{SessionService, SessionSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "resumable_upload_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Resumable Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage provider: {:?}", config.storage.provider);

    // Initialize storage backend
    let storage: Arc<dyn StorageAdapter> = match config.storage.provider {
        StorageProvider::Memory => {
            tracing::warn!("Using in-memory storage; uploads are lost on restart");
            Arc::new(MemoryStorage::new(
                config.storage.bucket.clone(),
                config.upload.min_chunk_size,
            ))
        }
        _ => {
            tracing::info!("S3 endpoint: {}", config.storage.endpoint);
            tracing::info!("S3 bucket: {}", config.storage.bucket);
            Arc::new(
                S3Client::new(&config.storage)
                    .await
                    .context("Failed to initialize S3 client")?,
            )
        }
    };

    let sessions = SessionService::new(storage, SessionSettings::from(&config.upload));

    // Background sweep of expired sessions
    let shutdown = CancellationToken::new();
    let sweep = sessions.clone().start_sweep_task(
        Duration::from_secs(config.upload.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let app_state = AppState::new(config.clone(), sessions);
    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Resumable Upload Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = sweep.await {
        tracing::warn!("Session sweep task ended abnormally: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler; also stops background tasks
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }

    shutdown.cancel();
}
