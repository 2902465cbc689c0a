//! Upload Session Service
//!
//! Public session operations on top of the [`SessionStore`] and a
//! [`StorageAdapter`]:
//! - initiate / accept-chunk / complete / cancel / status
//! - expiry sweep, run periodically by a background task
//!
//! accept-chunk and complete are idempotent so client retries and duplicate
//! deliveries never double-store a part or re-assemble an object.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::error::StorageError;
use crate::storage::{CompletedPart, StorageAdapter};

use super::store::SessionStore;
use super::types::{
    total_chunks_for, CompletedUpload, InitiateUploadRequest, NewSession, SessionStatus,
    UploadError, UploadSession, DEFAULT_CHUNK_SIZE, MAX_PARTS, MIN_CHUNK_SIZE,
};

/// Fallback MIME type when the client sends none
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    /// Lifetime of a session from creation
    pub session_ttl: chrono::Duration,
    /// How long a completed session stays queryable after it expires
    pub completed_retention: chrono::Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            session_ttl: chrono::Duration::hours(24),
            completed_retention: chrono::Duration::hours(24),
        }
    }
}

impl From<&UploadConfig> for SessionSettings {
    fn from(config: &UploadConfig) -> Self {
        let ttl = chrono::Duration::seconds(config.session_ttl_secs);
        Self {
            default_chunk_size: config.default_chunk_size,
            min_chunk_size: config.min_chunk_size,
            session_ttl: ttl,
            completed_retention: ttl,
        }
    }
}

// ============================================================================
// Session Service
// ============================================================================

#[derive(Clone)]
pub struct SessionService {
    inner: Arc<SessionServiceInner>,
}

struct SessionServiceInner {
    store: SessionStore,
    storage: Arc<dyn StorageAdapter>,
    settings: SessionSettings,
}

impl SessionService {
    pub fn new(storage: Arc<dyn StorageAdapter>, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(SessionServiceInner {
                store: SessionStore::new(),
                storage,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Validate the request, open a multipart upload and record a new session
    pub async fn initiate(&self, request: InitiateUploadRequest) -> Result<UploadSession, UploadError> {
        let settings = &self.inner.settings;

        let file_name = request.file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::Validation("fileName is required".to_string()));
        }
        if request.file_size == 0 {
            return Err(UploadError::Validation("fileSize must be greater than zero".to_string()));
        }

        let chunk_size = request.chunk_size.unwrap_or(settings.default_chunk_size);
        if chunk_size == 0 {
            return Err(UploadError::InvalidChunkSize {
                size: 0,
                min: settings.min_chunk_size,
            });
        }
        // A file that fits in one chunk only has a final part, which may be small.
        if chunk_size < settings.min_chunk_size && request.file_size > chunk_size {
            return Err(UploadError::InvalidChunkSize {
                size: chunk_size,
                min: settings.min_chunk_size,
            });
        }

        let total_chunks = total_chunks_for(request.file_size, chunk_size);
        if total_chunks > MAX_PARTS {
            return Err(UploadError::Validation(format!(
                "File needs {} chunks, at most {} are allowed; use a larger chunkSize",
                total_chunks, MAX_PARTS
            )));
        }

        let content_type = if request.file_type.trim().is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            request.file_type.clone()
        };
        let metadata = request.metadata.unwrap_or_default();
        let object_key = object_key_for(file_name);

        let storage_upload_id = self
            .inner
            .storage
            .initiate_multipart(&object_key, &content_type, &metadata)
            .await?;

        let session = UploadSession::new(
            NewSession {
                object_key,
                file_name: file_name.to_string(),
                file_size: request.file_size,
                content_type,
                chunk_size,
                metadata,
                storage_upload_id,
            },
            settings.session_ttl,
        );
        self.inner.store.insert(session.clone()).await;

        tracing::info!(
            session_id = %session.id,
            file_name = %session.file_name,
            file_size = session.file_size,
            chunks = session.total_chunks,
            object_key = %session.object_key,
            "Created upload session"
        );

        Ok(session)
    }

    /// Store one part and return its completion tag.
    ///
    /// A part number that is already stored returns the recorded tag without
    /// touching storage.
    pub async fn accept_chunk(
        &self,
        session_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, UploadError> {
        let handle = self
            .inner
            .store
            .handle(session_id)
            .await
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        let (key, upload_id) = {
            let mut session = handle.lock().await;
            ensure_accepting(&mut session, part_number)?;

            if let Some(tag) = session.parts.get(&part_number) {
                tracing::debug!(
                    session_id = %session_id,
                    part_number,
                    "Duplicate part delivery, returning stored tag"
                );
                return Ok(tag.clone());
            }

            let expected = expected_part_len(&session, part_number);
            if data.len() as u64 != expected {
                return Err(UploadError::Validation(format!(
                    "Part {} must be {} bytes, got {}",
                    part_number,
                    expected,
                    data.len()
                )));
            }

            (session.object_key.clone(), session.storage_upload_id.clone())
        };

        // Entry lock released: other parts of this session upload concurrently.
        let tag = self
            .inner
            .storage
            .upload_part(&key, &upload_id, part_number, data)
            .await?;

        let mut session = handle.lock().await;
        // The session may have been cancelled, swept or completed meanwhile.
        ensure_accepting(&mut session, part_number)?;

        let tag = session.parts.entry(part_number).or_insert(tag).clone();
        session.status = SessionStatus::Uploading;

        tracing::debug!(
            session_id = %session_id,
            part_number,
            parts_received = session.parts.len(),
            total_chunks = session.total_chunks,
            progress = %format!("{:.1}%", session.progress()),
            "Part stored"
        );

        Ok(tag)
    }

    /// Assemble the object once every part is stored.
    ///
    /// Repeated calls on a completed session return the recorded location.
    pub async fn complete(&self, session_id: &str) -> Result<CompletedUpload, UploadError> {
        let handle = self
            .inner
            .store
            .handle(session_id)
            .await
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        // Held across the storage call; the sweep cannot evict a session mid-completion.
        let mut session = handle.lock().await;

        match session.status {
            SessionStatus::Completed => return Ok(completed_upload(&session)),
            SessionStatus::Cancelled => {
                return Err(UploadError::SessionCancelled(session_id.to_string()))
            }
            SessionStatus::Failed => return Err(UploadError::SessionExpired(session_id.to_string())),
            SessionStatus::Pending | SessionStatus::Uploading => {}
        }

        if session.is_expired() {
            session.status = SessionStatus::Failed;
            return Err(UploadError::SessionExpired(session_id.to_string()));
        }

        if !session.has_all_parts() {
            return Err(UploadError::IncompleteUpload {
                expected: session.total_chunks,
                received: session.parts.len(),
            });
        }

        let parts: Vec<CompletedPart> = session
            .parts
            .iter()
            .map(|(part_number, tag)| CompletedPart {
                part_number: *part_number,
                completion_tag: tag.clone(),
            })
            .collect();

        tracing::info!(
            session_id = %session_id,
            file_name = %session.file_name,
            parts = parts.len(),
            "Completing multipart upload"
        );

        let location = self
            .inner
            .storage
            .complete_multipart(&session.object_key, &session.storage_upload_id, &parts)
            .await?;

        session.status = SessionStatus::Completed;
        session.location = Some(location);
        session.completed_at = Some(Utc::now());

        tracing::info!(
            session_id = %session_id,
            object_key = %session.object_key,
            "Upload session completed"
        );

        Ok(completed_upload(&session))
    }

    /// Abort the backend upload and forget the session
    pub async fn cancel(&self, session_id: &str) -> Result<(), UploadError> {
        let handle = self
            .inner
            .store
            .handle(session_id)
            .await
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        let mut session = handle.lock().await;
        match session.status {
            SessionStatus::Completed => {
                return Err(UploadError::CannotCancelCompleted(session_id.to_string()))
            }
            // Lost a race with another cancel or the sweep; the entry is already gone.
            SessionStatus::Cancelled => {
                return Err(UploadError::SessionNotFound(session_id.to_string()))
            }
            _ => {}
        }

        match self
            .inner
            .storage
            .abort_multipart(&session.object_key, &session.storage_upload_id)
            .await
        {
            Ok(()) => {}
            Err(StorageError::UploadNotFound(_)) => {
                tracing::debug!(session_id = %session_id, "Backend upload already gone");
            }
            Err(e) => return Err(e.into()),
        }

        session.status = SessionStatus::Cancelled;
        self.inner.store.remove(session_id).await;

        tracing::info!(
            session_id = %session_id,
            file_name = %session.file_name,
            "Upload session cancelled"
        );

        Ok(())
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Read-only snapshot of a session
    pub async fn get_status(&self, session_id: &str) -> Option<UploadSession> {
        self.inner.store.snapshot(session_id).await
    }

    pub async fn session_count(&self) -> usize {
        self.inner.store.len().await
    }

    pub async fn active_session_count(&self) -> usize {
        self.inner.store.active_count().await
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Abort and remove every expired session that never completed.
    ///
    /// Completed sessions are kept past expiry for `completed_retention` so
    /// repeated complete calls still find them. Returns the number of
    /// expired sessions aborted.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let retention = self.inner.settings.completed_retention;
        let mut swept = 0;

        for (id, handle) in self.inner.store.handles().await {
            // Expiry and status are judged under the entry lock.
            let mut session = handle.lock().await;

            match session.status {
                SessionStatus::Completed => {
                    if now > session.expires_at + retention {
                        self.inner.store.remove(&id).await;
                        tracing::debug!(session_id = %id, "Evicted completed session");
                    }
                    continue;
                }
                SessionStatus::Cancelled => continue,
                _ => {}
            }

            if !session.is_expired_at(now) {
                continue;
            }

            session.status = SessionStatus::Failed;
            if let Err(e) = self
                .inner
                .storage
                .abort_multipart(&session.object_key, &session.storage_upload_id)
                .await
            {
                tracing::warn!(
                    session_id = %id,
                    error = %e,
                    "Failed to abort expired multipart upload"
                );
            }
            self.inner.store.remove(&id).await;
            swept += 1;

            tracing::debug!(
                session_id = %id,
                file_name = %session.file_name,
                "Cleaned up expired session"
            );
        }

        if swept > 0 {
            let active = self.active_session_count().await;
            tracing::info!(count = swept, active, "Cleaned up expired upload sessions");
        }

        swept
    }

    /// Start background sweep task, stopped by `shutdown`
    pub fn start_sweep_task(
        self,
        period: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Session sweep task stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        self.sweep_expired().await;
                    }
                }
            }
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Reject parts for sessions that can no longer take them
fn ensure_accepting(session: &mut UploadSession, part_number: u32) -> Result<(), UploadError> {
    match session.status {
        SessionStatus::Completed => {
            return Err(UploadError::SessionAlreadyCompleted(session.id.clone()))
        }
        SessionStatus::Cancelled => return Err(UploadError::SessionCancelled(session.id.clone())),
        SessionStatus::Failed => return Err(UploadError::SessionExpired(session.id.clone())),
        SessionStatus::Pending | SessionStatus::Uploading => {}
    }

    if session.is_expired() {
        session.status = SessionStatus::Failed;
        return Err(UploadError::SessionExpired(session.id.clone()));
    }

    if part_number == 0 || part_number as usize > session.total_chunks {
        return Err(UploadError::InvalidPartNumber {
            part: part_number,
            total: session.total_chunks,
        });
    }

    Ok(())
}

/// Byte length of `part_number`: the chunk size, or the remainder for the last part
fn expected_part_len(session: &UploadSession, part_number: u32) -> u64 {
    let start = (part_number as u64 - 1) * session.chunk_size;
    session.chunk_size.min(session.file_size - start)
}

fn completed_upload(session: &UploadSession) -> CompletedUpload {
    CompletedUpload {
        session_id: session.id.clone(),
        file_name: session.file_name.clone(),
        file_size: session.file_size,
        object_key: session.object_key.clone(),
        location: session.location.clone().unwrap_or_default(),
        completed_at: session.completed_at.unwrap_or(session.created_at),
    }
}

/// `uploads/{yyyy}/{mm}/{dd}/{uuid}-{name}` with the name reduced to safe characters
fn object_key_for(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "uploads/{}/{}-{}",
        Utc::now().format("%Y/%m/%d"),
        Uuid::new_v4(),
        safe
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const MB: u64 = 1_000_000;

    fn service_with(ttl: chrono::Duration) -> (SessionService, MemoryStorage) {
        let storage = MemoryStorage::new("test", 5 * MB);
        let settings = SessionSettings {
            default_chunk_size: 5 * MB,
            min_chunk_size: 5 * MB,
            session_ttl: ttl,
            completed_retention: chrono::Duration::hours(1),
        };
        (SessionService::new(Arc::new(storage.clone()), settings), storage)
    }

    fn service() -> (SessionService, MemoryStorage) {
        service_with(chrono::Duration::hours(1))
    }

    fn request(file_size: u64, chunk_size: Option<u64>) -> InitiateUploadRequest {
        InitiateUploadRequest {
            file_name: "video.mp4".to_string(),
            file_size,
            file_type: "video/mp4".to_string(),
            chunk_size,
            metadata: None,
        }
    }

    fn part_bytes(session: &UploadSession, part_number: u32) -> Bytes {
        let len = expected_part_len(session, part_number) as usize;
        Bytes::from(vec![part_number as u8; len])
    }

    #[tokio::test]
    async fn test_initiate_computes_total_chunks() {
        let (service, storage) = service();
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();

        assert_eq!(session.total_chunks, 3);
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.object_key.ends_with("-video.mp4"));
        assert_eq!(storage.call_counts().initiate, 1);
    }

    #[tokio::test]
    async fn test_initiate_rejects_small_chunk_size() {
        let (service, storage) = service();
        let err = service.initiate(request(12 * MB, Some(MB))).await.unwrap_err();

        assert!(matches!(err, UploadError::InvalidChunkSize { size, .. } if size == MB));
        assert_eq!(storage.call_counts().initiate, 0);
    }

    #[tokio::test]
    async fn test_initiate_allows_small_single_part() {
        let (service, _) = service();
        let session = service.initiate(request(1000, Some(2000))).await.unwrap();
        assert_eq!(session.total_chunks, 1);
    }

    #[tokio::test]
    async fn test_initiate_validates_fields() {
        let (service, _) = service();
        let mut bad = request(10, None);
        bad.file_name = "  ".to_string();
        assert!(matches!(service.initiate(bad).await, Err(UploadError::Validation(_))));
        assert!(matches!(
            service.initiate(request(0, None)).await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_chunk_is_idempotent() {
        let (service, storage) = service();
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();

        let first = service.accept_chunk(&session.id, 1, part_bytes(&session, 1)).await.unwrap();
        let second = service.accept_chunk(&session.id, 1, part_bytes(&session, 1)).await.unwrap();

        assert_eq!(first, second);
        let snap = service.get_status(&session.id).await.unwrap();
        assert_eq!(snap.parts.len(), 1);
        assert_eq!(snap.status, SessionStatus::Uploading);
        assert_eq!(storage.call_counts().upload_part, 1);
    }

    #[tokio::test]
    async fn test_accept_chunk_rejects_bad_part_numbers() {
        let (service, _) = service();
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();

        for part in [0, 4] {
            let err = service
                .accept_chunk(&session.id, part, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidPartNumber { total: 3, .. }));
        }
    }

    #[tokio::test]
    async fn test_accept_chunk_rejects_wrong_length() {
        let (service, _) = service();
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();

        let err = service
            .accept_chunk(&session.id, 3, Bytes::from(vec![0u8; 10]))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_accept_chunk_unknown_session() {
        let (service, _) = service();
        let err = service
            .accept_chunk("missing", 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_accept_chunk_on_expired_session_marks_failed() {
        let (service, _) = service_with(chrono::Duration::milliseconds(1));
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = service
            .accept_chunk(&session.id, 1, part_bytes(&session, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionExpired(_)));
        assert_eq!(
            service.get_status(&session.id).await.unwrap().status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_complete_requires_every_part() {
        let (service, storage) = service();
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();
        service.accept_chunk(&session.id, 1, part_bytes(&session, 1)).await.unwrap();

        let err = service.complete(&session.id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload { expected: 3, received: 1 }
        ));
        assert_eq!(storage.call_counts().complete, 0);
    }

    #[tokio::test]
    async fn test_end_to_end_complete_is_idempotent() {
        let (service, storage) = service();
        let session = service.initiate(request(12_000_000, Some(5_000_000))).await.unwrap();
        assert_eq!(session.total_chunks, 3);

        for part in [3, 1, 2] {
            service.accept_chunk(&session.id, part, part_bytes(&session, part)).await.unwrap();
        }

        let first = service.complete(&session.id).await.unwrap();
        let second = service.complete(&session.id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.call_counts().complete, 1);

        let object = storage.object(&session.object_key).await.unwrap();
        assert_eq!(object.data.len(), 12_000_000);
        assert_eq!(object.data[0], 1);
        assert_eq!(object.data[11_999_999], 3);

        let err = service
            .accept_chunk(&session.id, 1, part_bytes(&session, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionAlreadyCompleted(_)));
    }

    #[tokio::test]
    async fn test_end_to_end_cancel() {
        let (service, storage) = service();
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();
        service.accept_chunk(&session.id, 1, part_bytes(&session, 1)).await.unwrap();

        service.cancel(&session.id).await.unwrap();

        assert!(service.get_status(&session.id).await.is_none());
        assert_eq!(storage.call_counts().abort, 1);
        assert_eq!(storage.pending_upload_count().await, 0);
        assert!(matches!(
            service.cancel(&session.id).await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert_eq!(storage.call_counts().abort, 1);
    }

    #[tokio::test]
    async fn test_cannot_cancel_completed() {
        let (service, _) = service();
        let session = service.initiate(request(1000, Some(5 * MB))).await.unwrap();
        service.accept_chunk(&session.id, 1, part_bytes(&session, 1)).await.unwrap();
        service.complete(&session.id).await.unwrap();

        let err = service.cancel(&session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::CannotCancelCompleted(_)));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_sessions() {
        let (service, storage) = service_with(chrono::Duration::milliseconds(200));
        let expired = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();
        let done = service.initiate(request(1000, Some(5 * MB))).await.unwrap();
        service.accept_chunk(&done.id, 1, part_bytes(&done, 1)).await.unwrap();
        service.complete(&done.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let swept = service.sweep_expired().await;

        assert_eq!(swept, 1);
        assert!(service.get_status(&expired.id).await.is_none());
        assert!(service.get_status(&done.id).await.is_some());
        assert_eq!(storage.call_counts().abort, 1);
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_sessions() {
        let (service, storage) = service();
        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();

        assert_eq!(service.sweep_expired().await, 0);
        assert!(service.get_status(&session.id).await.is_some());
        assert_eq!(storage.call_counts().abort, 0);
    }

    #[tokio::test]
    async fn test_concurrent_parts_of_one_session() {
        let (service, storage) = service();
        let session = service.initiate(request(50 * MB, Some(5 * MB))).await.unwrap();
        assert_eq!(session.total_chunks, 10);

        let mut tasks = Vec::new();
        for part in 1..=10u32 {
            // Every part delivered twice, concurrently.
            for _ in 0..2 {
                let service = service.clone();
                let id = session.id.clone();
                let data = part_bytes(&session, part);
                tasks.push(tokio::spawn(async move { service.accept_chunk(&id, part, data).await }));
            }
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        let snap = service.get_status(&session.id).await.unwrap();
        assert_eq!(snap.parts.len(), 10);
        assert_eq!(snap.total_chunks, 10);
        assert!(storage.call_counts().upload_part >= 10);
        service.complete(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_default_settings_accept_5mb_chunks() {
        let storage = MemoryStorage::new("test", MIN_CHUNK_SIZE);
        let service = SessionService::new(Arc::new(storage.clone()), SessionSettings::default());

        let session = service.initiate(request(12_000_000, Some(5_000_000))).await.unwrap();
        assert_eq!(session.total_chunks, 3);

        for part in 1..=3 {
            service.accept_chunk(&session.id, part, part_bytes(&session, part)).await.unwrap();
        }
        let first = service.complete(&session.id).await.unwrap();
        let second = service.complete(&session.id).await.unwrap();

        assert_eq!(first.location, second.location);
        assert_eq!(storage.call_counts().complete, 1);
    }

    /// Memory backend whose complete call takes a while
    struct SlowComplete {
        inner: MemoryStorage,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl StorageAdapter for SlowComplete {
        async fn initiate_multipart(
            &self,
            key: &str,
            content_type: &str,
            metadata: &std::collections::HashMap<String, String>,
        ) -> crate::error::StorageResult<String> {
            self.inner.initiate_multipart(key, content_type, metadata).await
        }

        async fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: u32,
            data: Bytes,
        ) -> crate::error::StorageResult<String> {
            self.inner.upload_part(key, upload_id, part_number, data).await
        }

        async fn complete_multipart(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[CompletedPart],
        ) -> crate::error::StorageResult<String> {
            tokio::time::sleep(self.delay).await;
            self.inner.complete_multipart(key, upload_id, parts).await
        }

        async fn abort_multipart(&self, key: &str, upload_id: &str) -> crate::error::StorageResult<()> {
            self.inner.abort_multipart(key, upload_id).await
        }
    }

    #[tokio::test]
    async fn test_sweep_waits_for_in_flight_complete() {
        let storage = MemoryStorage::new("test", 5 * MB);
        let adapter = SlowComplete {
            inner: storage.clone(),
            delay: Duration::from_millis(300),
        };
        let settings = SessionSettings {
            default_chunk_size: 5 * MB,
            min_chunk_size: 5 * MB,
            session_ttl: chrono::Duration::milliseconds(150),
            completed_retention: chrono::Duration::hours(1),
        };
        let service = SessionService::new(Arc::new(adapter), settings);

        let session = service.initiate(request(12 * MB, Some(5 * MB))).await.unwrap();
        for part in 1..=3 {
            service.accept_chunk(&session.id, part, part_bytes(&session, part)).await.unwrap();
        }

        let completing = {
            let service = service.clone();
            let id = session.id.clone();
            tokio::spawn(async move { service.complete(&id).await })
        };

        // Deadline passes while complete still holds the session.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.sweep_expired().await, 0);

        completing.await.unwrap().unwrap();
        let snap = service.get_status(&session.id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Completed);
        assert_eq!(storage.call_counts().complete, 1);
        assert_eq!(storage.call_counts().abort, 0);
    }

    #[tokio::test]
    async fn test_sweep_task_stops_on_shutdown() {
        let (service, _) = service();
        let shutdown = CancellationToken::new();
        let task = service.start_sweep_task(Duration::from_millis(5), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
