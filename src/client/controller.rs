//! Upload Controller
//!
//! Drives one [`UploadTransfer`] to completion:
//! - Opens a session, or reconciles against the held one before resuming
//! - Uploads pending chunks with a fixed pool of workers sharing one queue
//! - Retries each chunk with exponential backoff
//! - Pauses cooperatively, cancels, and re-runs failed chunks
//!
//! State changes are published as [`TransferEvent`]s on the channel returned
//! by [`UploadController::new`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::upload::{
    CompleteUploadRequest, InitiateUploadRequest, SessionStatus, DEFAULT_PARALLEL_CHUNKS,
};

use super::api::UploadApi;
use super::retry::RetryPolicy;
use super::source::ChunkSource;
use super::types::{ChunkStatus, ClientError, FileChunk, TransferEvent, TransferStatus, UploadTransfer};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Worker count; at least one worker always runs
    pub max_parallel_chunks: usize,
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_parallel_chunks: DEFAULT_PARALLEL_CHUNKS,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&UploadConfig> for ControllerConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_parallel_chunks: config.max_parallel_chunks,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
        }
    }
}

/// State shared between the controller and its workers
#[derive(Clone)]
struct WorkerContext {
    api: Arc<dyn UploadApi>,
    source: Arc<dyn ChunkSource>,
    transfer: Arc<Mutex<UploadTransfer>>,
    queue: Arc<Mutex<VecDeque<usize>>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    retry: RetryPolicy,
    pause: CancellationToken,
    session_id: String,
}

pub struct UploadController {
    api: Arc<dyn UploadApi>,
    source: Arc<dyn ChunkSource>,
    config: ControllerConfig,
    transfer: Arc<Mutex<UploadTransfer>>,
    queue: Arc<Mutex<VecDeque<usize>>>,
    /// Session the controller is working against; released on failure or completion
    session_id: Mutex<Option<String>>,
    /// Pause token of the current run
    pause: std::sync::Mutex<CancellationToken>,
    running: AtomicBool,
    events: mpsc::UnboundedSender<TransferEvent>,
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl UploadController {
    /// Create a controller for `transfer`, reading bytes from `source`.
    ///
    /// A transfer that already carries a session id resumes that session.
    pub fn new(
        api: Arc<dyn UploadApi>,
        source: Arc<dyn ChunkSource>,
        transfer: UploadTransfer,
        config: ControllerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransferEvent>), ClientError> {
        if source.size() != transfer.file_size {
            return Err(ClientError::Validation(format!(
                "source has {} bytes, transfer expects {}",
                source.size(),
                transfer.file_size
            )));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            api,
            source,
            config,
            session_id: Mutex::new(transfer.session_id.clone()),
            transfer: Arc::new(Mutex::new(transfer)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            pause: std::sync::Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            events,
        };
        Ok((controller, rx))
    }

    /// Copy of the transfer as it stands
    pub async fn snapshot(&self) -> UploadTransfer {
        self.transfer.lock().await.clone()
    }

    /// Session currently held by the controller
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    // ========================================================================
    // Public Operations
    // ========================================================================

    /// Start or resume the transfer and run it until it completes, fails or
    /// is paused.
    pub async fn start(&self) -> Result<TransferStatus, ClientError> {
        self.run().await
    }

    /// Resume a paused transfer
    pub async fn resume(&self) -> Result<TransferStatus, ClientError> {
        self.run().await
    }

    /// Ask workers to stop after their in-flight request
    pub fn pause(&self) {
        if let Ok(token) = self.pause.lock() {
            token.cancel();
        }
    }

    /// Stop the transfer for good and abort the server session (best-effort)
    pub async fn cancel(&self) {
        // Recorded before workers are stopped so a finishing run sees it.
        let recorded = {
            let mut transfer = self.transfer.lock().await;
            if transfer.status.is_terminal() {
                return;
            }
            transfer.status = TransferStatus::Cancelled;
            transfer.error = None;
            transfer.session_id.take()
        };
        self.emit(TransferEvent::StatusChanged {
            status: TransferStatus::Cancelled,
            error: None,
        });

        self.pause();
        self.queue.lock().await.clear();

        let held = self.session_id.lock().await.take();
        if let Some(id) = held.or(recorded) {
            match self.api.cancel(&id).await {
                Ok(()) => info!(session_id = %id, "Upload cancelled"),
                Err(e) => warn!(session_id = %id, error = %e, "Failed to cancel session on server"),
            }
        }
    }

    /// Re-run every chunk that ended in Error
    pub async fn retry_failed(&self) -> Result<TransferStatus, ClientError> {
        {
            let mut transfer = self.transfer.lock().await;
            if transfer.status == TransferStatus::Cancelled {
                return Err(ClientError::Cancelled);
            }
            for chunk in transfer.chunks.iter_mut().filter(|c| c.status == ChunkStatus::Error) {
                chunk.reset();
            }
            transfer.error = None;
        }

        self.run().await
    }

    // ========================================================================
    // Run
    // ========================================================================

    async fn run(&self) -> Result<TransferStatus, ClientError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        {
            let transfer = self.transfer.lock().await;
            match transfer.status {
                TransferStatus::Cancelled => return Err(ClientError::Cancelled),
                TransferStatus::Completed => return Ok(TransferStatus::Completed),
                _ => {}
            }
        }

        let pause = CancellationToken::new();
        if let Ok(mut token) = self.pause.lock() {
            *token = pause.clone();
        }

        self.set_status(TransferStatus::Uploading, None).await;

        let session_id = match self.prepare_session().await {
            Ok(id) => id,
            Err(ClientError::Cancelled) => return Ok(TransferStatus::Cancelled),
            Err(e) => {
                self.fail(e.to_string()).await;
                return Err(e);
            }
        };

        // Queue every chunk the server does not hold yet.
        let (pending, total) = {
            let transfer = self.transfer.lock().await;
            let pending: VecDeque<usize> = transfer
                .chunks
                .iter()
                .filter(|c| c.status != ChunkStatus::Success)
                .map(|c| c.index)
                .collect();
            self.emit(TransferEvent::Progress {
                completed: transfer.completed_chunks(),
                total: transfer.total_chunks(),
            });
            (pending, transfer.total_chunks())
        };
        let queued = pending.len();
        *self.queue.lock().await = pending;

        let workers = self.config.max_parallel_chunks.max(1);
        info!(
            session_id = %session_id,
            queued,
            total,
            workers,
            "Uploading chunks"
        );

        let ctx = WorkerContext {
            api: self.api.clone(),
            source: self.source.clone(),
            transfer: self.transfer.clone(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            retry: self.config.retry,
            pause: pause.clone(),
            session_id: session_id.clone(),
        };

        let handles: Vec<_> = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(ctx.clone(), worker)))
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Upload worker terminated abnormally");
            }
        }

        if self.transfer.lock().await.status == TransferStatus::Cancelled {
            return Ok(TransferStatus::Cancelled);
        }

        if pause.is_cancelled() {
            info!(session_id = %session_id, "Upload paused");
            self.set_status(TransferStatus::Paused, None).await;
            return Ok(TransferStatus::Paused);
        }

        let failed = self.transfer.lock().await.failed_chunks();
        if !failed.is_empty() {
            let message = format!("{} chunk(s) failed: {:?}", failed.len(), failed);
            warn!(session_id = %session_id, failed = failed.len(), "Upload failed");
            // Server session stays open so retry_failed can pick it up again.
            *self.session_id.lock().await = None;
            self.set_status(TransferStatus::Failed, Some(message)).await;
            return Ok(TransferStatus::Failed);
        }

        self.finish(&session_id, total).await
    }

    /// Steps before scheduling: open a session or reconcile with the held one.
    /// Returns the session id to upload against.
    async fn prepare_session(&self) -> Result<String, ClientError> {
        let held = self.session_id.lock().await.clone();
        let recorded = self.transfer.lock().await.session_id.clone();
        // Without any session, progress from an earlier one cannot be trusted.
        let Some(session_id) = held.or(recorded) else {
            return self.restart_session().await;
        };

        match self.api.status(&session_id).await {
            Ok(status) if matches!(status.status, SessionStatus::Failed | SessionStatus::Cancelled) => {
                warn!(session_id = %session_id, status = ?status.status, "Held session is no longer usable");
                self.restart_session().await
            }
            Ok(status) => {
                *self.session_id.lock().await = Some(session_id.clone());
                let mut transfer = self.transfer.lock().await;
                if status.total_chunks != transfer.total_chunks() {
                    warn!(
                        session_id = %session_id,
                        server_chunks = status.total_chunks,
                        local_chunks = transfer.total_chunks(),
                        "Held session was planned differently, starting over"
                    );
                    drop(transfer);
                    return self.restart_session().await;
                }

                transfer.reconcile(&status.uploaded_chunk_indices);
                debug!(
                    session_id = %session_id,
                    server_chunks = status.uploaded_chunk_indices.len(),
                    local_success = transfer.completed_chunks(),
                    "Reconciled with server"
                );
                Ok(session_id)
            }
            Err(ClientError::NotFound(_)) => {
                warn!(session_id = %session_id, "Held session is gone, starting over");
                self.restart_session().await
            }
            Err(e) => Err(e),
        }
    }

    /// Forget all progress and open a fresh session
    async fn restart_session(&self) -> Result<String, ClientError> {
        {
            let mut transfer = self.transfer.lock().await;
            for chunk in transfer.chunks.iter_mut() {
                chunk.reset();
            }
            transfer.session_id = None;
        }
        *self.session_id.lock().await = None;
        self.initiate().await
    }

    async fn initiate(&self) -> Result<String, ClientError> {
        let request = {
            let transfer = self.transfer.lock().await;
            InitiateUploadRequest {
                file_name: transfer.file_name.clone(),
                file_size: transfer.file_size,
                file_type: transfer.file_type.clone(),
                chunk_size: Some(transfer.chunk_size),
                metadata: None,
            }
        };

        let response = self.api.initiate(&request).await?;

        let mut transfer = self.transfer.lock().await;
        if transfer.status == TransferStatus::Cancelled {
            // Cancelled while the request was in flight; nobody else knows this id.
            drop(transfer);
            if let Err(e) = self.api.cancel(&response.session_id).await {
                warn!(session_id = %response.session_id, error = %e, "Failed to cancel session on server");
            }
            return Err(ClientError::Cancelled);
        }
        if response.total_chunks != transfer.total_chunks() {
            return Err(ClientError::Validation(format!(
                "server planned {} chunks, transfer has {}",
                response.total_chunks,
                transfer.total_chunks()
            )));
        }
        transfer.session_id = Some(response.session_id.clone());
        *self.session_id.lock().await = Some(response.session_id.clone());

        info!(
            session_id = %response.session_id,
            file_name = %transfer.file_name,
            chunks = response.total_chunks,
            "Upload session opened"
        );
        Ok(response.session_id)
    }

    async fn finish(&self, session_id: &str, total: usize) -> Result<TransferStatus, ClientError> {
        let file_name = self.transfer.lock().await.file_name.clone();
        let request = CompleteUploadRequest {
            session_id: session_id.to_string(),
            total_chunks: Some(total),
            file_name: Some(file_name),
        };

        match self.api.complete(&request).await {
            Ok(done) => {
                info!(session_id = %session_id, location = %done.location, "Upload completed");
                *self.session_id.lock().await = None;
                {
                    let mut transfer = self.transfer.lock().await;
                    transfer.location = Some(done.location);
                    transfer.session_id = None;
                }
                self.set_status(TransferStatus::Completed, None).await;
                Ok(TransferStatus::Completed)
            }
            Err(e) => {
                *self.session_id.lock().await = None;
                self.fail(e.to_string()).await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // State Helpers
    // ========================================================================

    async fn fail(&self, message: String) {
        self.set_status(TransferStatus::Failed, Some(message)).await;
    }

    /// Record a transfer status; a cancelled transfer never changes again
    async fn set_status(&self, status: TransferStatus, error: Option<String>) {
        {
            let mut transfer = self.transfer.lock().await;
            if transfer.status == TransferStatus::Cancelled {
                return;
            }
            transfer.status = status;
            transfer.error = error.clone();
        }
        self.emit(TransferEvent::StatusChanged { status, error });
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn worker_loop(ctx: WorkerContext, worker: usize) {
    loop {
        if ctx.pause.is_cancelled() {
            debug!(worker, "Worker stopping on pause");
            return;
        }

        let Some(index) = ctx.queue.lock().await.pop_front() else {
            debug!(worker, "Worker found queue empty");
            return;
        };

        ctx.upload_with_retry(index).await;
    }
}

impl WorkerContext {
    /// Upload one chunk, retrying with backoff. Returns whether it landed.
    async fn upload_with_retry(&self, index: usize) -> bool {
        let (start, end, total) = {
            let transfer = self.transfer.lock().await;
            let chunk = &transfer.chunks[index];
            (chunk.start, chunk.end, transfer.total_chunks())
        };

        let data = match self.source.read_range(start, end).await {
            Ok(data) => data,
            Err(e) => {
                self.update_chunk(index, |chunk| {
                    chunk.status = ChunkStatus::Error;
                    chunk.last_error = Some(e.to_string());
                })
                .await;
                return false;
            }
        };

        for attempt in 0..=self.retry.max_retries {
            if self.pause.is_cancelled() {
                self.update_chunk(index, |chunk| chunk.status = ChunkStatus::Pending).await;
                return false;
            }

            self.update_chunk(index, |chunk| {
                chunk.status = ChunkStatus::Uploading;
                chunk.retry_count = attempt;
            })
            .await;

            match self
                .api
                .upload_chunk(&self.session_id, index, total, data.clone())
                .await
            {
                Ok(_) => {
                    self.update_chunk(index, FileChunk::mark_success).await;
                    self.emit_progress().await;
                    return true;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        session_id = %self.session_id,
                        chunk_index = index,
                        attempt,
                        error = %message,
                        "Chunk upload failed"
                    );
                    self.update_chunk(index, |chunk| chunk.last_error = Some(message)).await;

                    if self.retry.has_attempts_after(attempt) {
                        let delay = self.retry.delay_for_attempt(attempt);
                        tokio::select! {
                            _ = self.pause.cancelled() => {
                                self.update_chunk(index, |chunk| chunk.status = ChunkStatus::Pending).await;
                                return false;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.update_chunk(index, |chunk| chunk.status = ChunkStatus::Error).await;
        false
    }

    async fn update_chunk(&self, index: usize, apply: impl FnOnce(&mut FileChunk)) {
        let chunk = {
            let mut transfer = self.transfer.lock().await;
            let chunk = &mut transfer.chunks[index];
            apply(chunk);
            chunk.clone()
        };
        let _ = self.events.send(TransferEvent::ChunkUpdated(chunk));
    }

    async fn emit_progress(&self) {
        let (completed, total) = {
            let transfer = self.transfer.lock().await;
            (transfer.completed_chunks(), transfer.total_chunks())
        };
        let _ = self.events.send(TransferEvent::Progress { completed, total });
    }
}

// ============================================================================
// Tests
// ============================================================================
