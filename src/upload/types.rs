//! Upload types for the resumable multipart protocol

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

// ============================================================================
// Constants
// ============================================================================

/// Default floor for every part except the last: 5MB
pub const MIN_CHUNK_SIZE: u64 = 5_000_000;

/// Default chunk size: 10MB
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Highest part number a multipart upload may use
pub const MAX_PARTS: usize = 10_000;

/// Chunks an upload client sends at once
pub const DEFAULT_PARALLEL_CHUNKS: usize = 3;

/// Retries per chunk after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff base delay for chunk retries, in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Upper bound on one client request, in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Number of chunks needed to cover `file_size` bytes
pub fn total_chunks_for(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as usize
}

// ============================================================================
// Initiate Types
// ============================================================================

/// Request to initiate a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// MIME type of the file
    pub file_type: String,

    /// Optional: chunk size in bytes (defaults to the server setting)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,

    /// Optional: user metadata stored with the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// Response to an initiate request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub session_id: String,
    pub file_name: String,
    pub total_chunks: usize,
    pub chunk_size: u64,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    /// 0-based chunk index that was uploaded
    pub chunk_index: usize,
    pub session_id: String,
    /// 1-based part number the chunk was stored as
    pub part_number: u32,
    pub completion_tag: String,
}

// ============================================================================
// Complete / Cancel Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Response after completing an upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Key the object was stored under
    pub object_key: String,
    pub location: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadResponse {
    pub session_id: String,
    pub message: String,
}

/// Session status as reported to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// 0-based indices of chunks the server holds, ascending
    pub uploaded_chunk_indices: Vec<usize>,
    pub total_chunks: usize,
    pub status: SessionStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Response Envelope
// ============================================================================

/// Successful response body: `{ "success": true, "data": ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data }
    }
}

/// Failed response body: `{ "success": false, "error": ..., "code": ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub success: bool,
    pub error: String,
    pub code: String,
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: String,

    /// Key the object is assembled under
    pub object_key: String,

    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// MIME type
    pub content_type: String,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// ceil(file_size / chunk_size)
    pub total_chunks: usize,

    /// User metadata forwarded to the backend
    pub metadata: HashMap<String, String>,

    /// Handle of the backend multipart upload
    pub storage_upload_id: String,

    /// Stored parts: part number (1-based) -> completion tag
    pub parts: BTreeMap<u32, String>,

    /// Current status
    pub status: SessionStatus,

    /// Final object location, once completed
    pub location: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    /// Session expiry time
    pub expires_at: DateTime<Utc>,
}

/// Everything `UploadSession::new` needs besides the clock
#[derive(Debug, Clone)]
pub struct NewSession {
    pub object_key: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub chunk_size: u64,
    pub metadata: HashMap<String, String>,
    pub storage_upload_id: String,
}

impl UploadSession {
    /// Create a new pending session that expires after `ttl`
    pub fn new(fields: NewSession, ttl: chrono::Duration) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            total_chunks: total_chunks_for(fields.file_size, fields.chunk_size),
            object_key: fields.object_key,
            file_name: fields.file_name,
            file_size: fields.file_size,
            content_type: fields.content_type,
            chunk_size: fields.chunk_size,
            metadata: fields.metadata,
            storage_upload_id: fields.storage_upload_id,
            parts: BTreeMap::new(),
            status: SessionStatus::Pending,
            location: None,
            completed_at: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if session has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Check if session has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check if every part has been stored
    pub fn has_all_parts(&self) -> bool {
        self.parts.len() == self.total_chunks
    }

    /// 0-based indices of stored chunks, ascending
    pub fn uploaded_chunk_indices(&self) -> Vec<usize> {
        self.parts.keys().map(|p| (*p as usize) - 1).collect()
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.parts.len() as f64 / self.total_chunks as f64) * 100.0
    }

    pub fn status_response(&self) -> SessionStatusResponse {
        SessionStatusResponse {
            session_id: self.id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            uploaded_chunk_indices: self.uploaded_chunk_indices(),
            total_chunks: self.total_chunks,
            status: self.status,
            progress: self.progress(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Waiting for the first part
    Pending,
    /// At least one part stored
    Uploading,
    /// Object assembled in storage
    Completed,
    /// Session expired before completion
    Failed,
    /// Aborted by the client
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}

/// Outcome of a completed session
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedUpload {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub object_key: String,
    pub location: String,
    pub completed_at: DateTime<Utc>,
}

impl From<CompletedUpload> for CompleteUploadResponse {
    fn from(done: CompletedUpload) -> Self {
        CompleteUploadResponse {
            session_id: done.session_id,
            file_name: done.file_name,
            file_size: done.file_size,
            object_key: done.object_key,
            location: done.location,
            completed_at: done.completed_at,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session cancelled: {0}")]
    SessionCancelled(String),

    #[error("Session already completed: {0}")]
    SessionAlreadyCompleted(String),

    #[error("Cannot cancel completed session: {0}")]
    CannotCancelCompleted(String),

    #[error("Invalid part number: {part} (expected 1..={total})")]
    InvalidPartNumber { part: u32, total: usize },

    #[error("Invalid chunk size: {size} bytes (min: {min})")]
    InvalidChunkSize { size: u64, min: u64 },

    #[error("Incomplete upload: expected {expected} parts, received {received}")]
    IncompleteUpload { expected: usize, received: usize },

    #[error("Storage error: {0}")]
    Adapter(#[from] StorageError),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionExpired(_) => StatusCode::GONE,
            Self::SessionCancelled(_) => StatusCode::GONE,
            Self::SessionAlreadyCompleted(_) => StatusCode::CONFLICT,
            Self::CannotCancelCompleted(_) => StatusCode::BAD_REQUEST,
            Self::InvalidPartNumber { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidChunkSize { .. } => StatusCode::BAD_REQUEST,
            Self::IncompleteUpload { .. } => StatusCode::BAD_REQUEST,
            Self::Adapter(StorageError::PartTooSmall(_)) => StatusCode::BAD_REQUEST,
            Self::Adapter(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::SessionCancelled(_) => "SESSION_CANCELLED",
            Self::SessionAlreadyCompleted(_) => "SESSION_ALREADY_COMPLETED",
            Self::CannotCancelCompleted(_) => "CANNOT_CANCEL_COMPLETED",
            Self::InvalidPartNumber { .. } => "INVALID_PART_NUMBER",
            Self::InvalidChunkSize { .. } => "INVALID_CHUNK_SIZE",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::Adapter(StorageError::PartTooSmall(_)) => "PART_TOO_SMALL",
            Self::Adapter(_) => "STORAGE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(file_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession::new(
            NewSession {
                object_key: "uploads/x".to_string(),
                file_name: "x.bin".to_string(),
                file_size,
                content_type: "application/octet-stream".to_string(),
                chunk_size,
                metadata: HashMap::new(),
                storage_upload_id: "up-1".to_string(),
            },
            chrono::Duration::hours(1),
        )
    }

    #[test]
    fn test_total_chunks_rounds_up() {
        assert_eq!(total_chunks_for(12_000_000, 5_000_000), 3);
        assert_eq!(total_chunks_for(10_000_000, 5_000_000), 2);
        assert_eq!(total_chunks_for(1, 5_000_000), 1);
        assert_eq!(total_chunks_for(0, 5_000_000), 0);
    }

    #[test]
    fn test_uploaded_indices_are_zero_based() {
        let mut s = session(12_000_000, 5_000_000);
        s.parts.insert(3, "c".to_string());
        s.parts.insert(1, "a".to_string());

        assert_eq!(s.uploaded_chunk_indices(), vec![0, 2]);
        assert!(!s.has_all_parts());
        assert!((s.progress() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn test_error_status_codes() {
        use axum::http::StatusCode;
        assert_eq!(
            UploadError::SessionNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            UploadError::CannotCancelCompleted("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            UploadError::Adapter(StorageError::SdkError("boom".into())).code(),
            "STORAGE_ERROR"
        );
    }
}
