//! Upload Client
//!
//! Uploads one file to a resumable upload server. Ctrl+C pauses the transfer
//! and saves its state next to the file; running the same command again
//! resumes from the chunks the server already holds.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resumable_upload_server::client::{
    ChunkSource, ControllerConfig, FileSource, HttpUploadApi, RetryPolicy, TransferEvent, TransferStatus,
    UploadController, UploadTransfer,
};
use resumable_upload_server::config::{Config, UploadConfig};

#[derive(Parser, Debug)]
#[command(name = "upload-client", version, about = "Resumable chunked file upload")]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Server base URL
    #[arg(short, long, default_value = "http://localhost:3000")]
    server: String,

    /// Chunk size in bytes (defaults to DEFAULT_CHUNK_SIZE)
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Chunks uploaded at once (defaults to MAX_PARALLEL_CHUNKS)
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Retries per chunk after the first attempt (defaults to MAX_RETRIES)
    #[arg(long)]
    retries: Option<u32>,

    /// Backoff base delay in milliseconds (defaults to RETRY_DELAY_MS)
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Per-request timeout in seconds (defaults to REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// MIME type sent to the server
    #[arg(long, default_value = "application/octet-stream")]
    content_type: String,

    /// Where transfer state is saved (defaults to `<file>.upload.json`)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Cancel the saved transfer and abort its server session
    #[arg(long)]
    cancel: bool,
}

fn state_path(args: &Args) -> PathBuf {
    args.state.clone().unwrap_or_else(|| {
        let mut name = args.file.clone().into_os_string();
        name.push(".upload.json");
        PathBuf::from(name)
    })
}

async fn load_or_plan(
    args: &Args,
    state: &Path,
    source: &FileSource,
    defaults: &UploadConfig,
) -> anyhow::Result<UploadTransfer> {
    if tokio::fs::try_exists(state).await.unwrap_or(false) {
        let transfer = UploadTransfer::load(state)
            .await
            .with_context(|| format!("Failed to read {}", state.display()))?;
        if transfer.file_size != source.size() {
            bail!(
                "{} changed since the saved transfer ({} bytes, expected {}); delete {} to start over",
                source.path().display(),
                source.size(),
                transfer.file_size,
                state.display()
            );
        }
        tracing::info!(
            "Resuming {} ({}/{} chunks done)",
            transfer.file_name,
            transfer.completed_chunks(),
            transfer.total_chunks()
        );
        return Ok(transfer);
    }

    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("File path has no file name")?;
    let chunk_size = args.chunk_size.unwrap_or(defaults.default_chunk_size);

    Ok(UploadTransfer::new(
        file_name,
        source.size(),
        args.content_type.clone(),
        chunk_size,
    )?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "upload_client=info,resumable_upload_server=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let defaults = Config::from_env().map(|c| c.upload).unwrap_or_default();

    let source = FileSource::open(&args.file)
        .await
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    let state = state_path(&args);
    let transfer = load_or_plan(&args, &state, &source, &defaults).await?;

    let mut config = ControllerConfig::from(&defaults);
    if let Some(parallel) = args.parallel {
        config.max_parallel_chunks = parallel;
    }
    config.retry = RetryPolicy::new(
        args.retries.unwrap_or(defaults.max_retries),
        Duration::from_millis(args.retry_delay_ms.unwrap_or(defaults.retry_base_delay_ms)),
    );

    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(defaults.request_timeout_secs).max(1));
    let api = Arc::new(HttpUploadApi::with_timeout(args.server.clone(), timeout)?);
    let (controller, mut events) = UploadController::new(api, Arc::new(source), transfer, config)?;
    let controller = Arc::new(controller);

    if args.cancel {
        controller.cancel().await;
        if let Err(e) = tokio::fs::remove_file(&state).await {
            tracing::debug!("No saved state removed: {}", e);
        }
        tracing::info!("Transfer cancelled");
        return Ok(());
    }

    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Progress { completed, total } => {
                    tracing::info!("Progress: {}/{} chunks", completed, total);
                }
                TransferEvent::StatusChanged { status, error } => match error {
                    Some(error) => tracing::warn!("Transfer {:?}: {}", status, error),
                    None => tracing::info!("Transfer {:?}", status),
                },
                TransferEvent::ChunkUpdated(chunk) => {
                    tracing::debug!("Chunk {} {:?}", chunk.index, chunk.status);
                }
            }
        }
    });

    let pauser = {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, pausing after in-flight chunks...");
                controller.pause();
            }
        })
    };

    let result = controller.start().await;
    pauser.abort();
    let _ = pauser.await;

    let snapshot = controller.snapshot().await;
    drop(controller);
    let _ = reporter.await;

    let status = match result {
        Ok(status) => status,
        Err(e) => {
            if let Err(save_err) = snapshot.save(&state).await {
                tracing::warn!("Failed to save {}: {}", state.display(), save_err);
            }
            return Err(e.into());
        }
    };

    match status {
        TransferStatus::Completed => {
            if let Err(e) = tokio::fs::remove_file(&state).await {
                tracing::debug!("No saved state removed: {}", e);
            }
            println!(
                "Uploaded {} to {}",
                snapshot.file_name,
                snapshot.location.as_deref().unwrap_or("(unknown location)")
            );
            Ok(())
        }
        status => {
            snapshot
                .save(&state)
                .await
                .with_context(|| format!("Failed to save {}", state.display()))?;
            println!(
                "Transfer {:?} at {}/{} chunks; state saved to {}",
                status,
                snapshot.completed_chunks(),
                snapshot.total_chunks(),
                state.display()
            );
            if status == TransferStatus::Failed {
                bail!(snapshot.error.unwrap_or_else(|| "upload failed".to_string()));
            }
            Ok(())
        }
    }
}
