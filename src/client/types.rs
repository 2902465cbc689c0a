//! Client-side transfer types

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::planner::plan;

// ============================================================================
// Error Types
// ============================================================================

/// Client error types
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Server does not know the session
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error {status} ({code}): {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Chunk upload failed: {0}")]
    ChunkUpload(String),

    #[error("A transfer is already running on this controller")]
    AlreadyRunning,

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Chunk Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Success,
    Error,
}

/// One byte range of the local file and its upload state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    /// 0-based; part number on the server is `index + 1`
    pub index: usize,
    pub start: u64,
    /// Exclusive end offset
    pub end: u64,
    pub status: ChunkStatus,
    pub retry_count: u32,
    /// 0 until the chunk lands, then 100
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FileChunk {
    /// Pending chunks covering `file_size` bytes
    pub fn plan_for(file_size: u64, chunk_size: u64) -> Result<Vec<FileChunk>, ClientError> {
        if chunk_size == 0 {
            return Err(ClientError::Validation("chunk size must be greater than zero".to_string()));
        }

        Ok(plan(file_size, chunk_size)
            .into_iter()
            .map(|range| FileChunk {
                index: range.index,
                start: range.start,
                end: range.end,
                status: ChunkStatus::Pending,
                retry_count: 0,
                progress: 0,
                last_error: None,
            })
            .collect())
    }

    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Back to a fresh pending chunk
    pub fn reset(&mut self) {
        self.status = ChunkStatus::Pending;
        self.retry_count = 0;
        self.progress = 0;
        self.last_error = None;
    }

    pub(crate) fn mark_success(&mut self) {
        self.status = ChunkStatus::Success;
        self.progress = 100;
        self.retry_count = 0;
        self.last_error = None;
    }
}

/// Align local chunk state with the 0-based indices the server holds.
///
/// Chunks the server holds become Success. Local Success (or an interrupted
/// Uploading) the server does not confirm goes back to Pending. Error chunks
/// the server does not hold keep their error.
pub fn reconcile(chunks: &mut [FileChunk], uploaded: &[usize]) {
    let uploaded: HashSet<usize> = uploaded.iter().copied().collect();

    for chunk in chunks.iter_mut() {
        if uploaded.contains(&chunk.index) {
            chunk.mark_success();
        } else if matches!(chunk.status, ChunkStatus::Success | ChunkStatus::Uploading) {
            chunk.reset();
        }
    }
}

// ============================================================================
// Transfer Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Cancelled)
    }
}

/// One file being uploaded: its chunks, session and overall state.
///
/// Serializable so a client can persist it and resume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTransfer {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub chunk_size: u64,
    pub chunks: Vec<FileChunk>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub status: TransferStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl UploadTransfer {
    /// Plan a new transfer of `file_size` bytes
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        file_type: impl Into<String>,
        chunk_size: u64,
    ) -> Result<Self, ClientError> {
        let file_name = file_name.into();
        if file_name.trim().is_empty() {
            return Err(ClientError::Validation("file name is empty".to_string()));
        }
        if file_size == 0 {
            return Err(ClientError::Validation("file is empty".to_string()));
        }
        let chunks = FileChunk::plan_for(file_size, chunk_size)?;

        Ok(Self {
            file_name,
            file_size,
            file_type: file_type.into(),
            chunk_size,
            chunks,
            session_id: None,
            status: TransferStatus::Pending,
            error: None,
            location: None,
        })
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Success)
            .count()
    }

    /// Indices of chunks that exhausted their retries
    pub fn failed_chunks(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Error)
            .map(|c| c.index)
            .collect()
    }

    /// Fraction of chunks uploaded, 0.0..=1.0
    pub fn progress(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        self.completed_chunks() as f64 / self.chunks.len() as f64
    }

    /// See [`reconcile`]
    pub fn reconcile(&mut self, uploaded: &[usize]) {
        reconcile(&mut self.chunks, uploaded);
    }

    /// Persist the transfer as JSON
    pub async fn save(&self, path: &Path) -> Result<(), ClientError> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Load a transfer persisted by [`save`](Self::save)
    pub async fn load(path: &Path) -> Result<Self, ClientError> {
        let json = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&json)?)
    }
}

// ============================================================================
// Events
// ============================================================================

/// State changes reported by the upload controller
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StatusChanged {
        status: TransferStatus,
        error: Option<String>,
    },
    ChunkUpdated(FileChunk),
    Progress {
        completed: usize,
        total: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(transfer: &UploadTransfer) -> Vec<ChunkStatus> {
        transfer.chunks.iter().map(|c| c.status).collect()
    }

    #[test]
    fn test_new_transfer_plans_chunks() {
        let transfer = UploadTransfer::new("a.bin", 12_000_000, "application/octet-stream", 5_000_000).unwrap();

        assert_eq!(transfer.total_chunks(), 3);
        assert_eq!(transfer.chunks[2].part_number(), 3);
        assert_eq!(transfer.chunks[2].len(), 2_000_000);
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.progress(), 0.0);
    }

    #[test]
    fn test_new_transfer_validates() {
        assert!(UploadTransfer::new("a", 0, "x", 5).is_err());
        assert!(UploadTransfer::new("a", 10, "x", 0).is_err());
        assert!(UploadTransfer::new(" ", 10, "x", 5).is_err());
    }

    #[test]
    fn test_plan_for_rejects_zero_chunk_size() {
        assert!(matches!(FileChunk::plan_for(10, 0), Err(ClientError::Validation(_))));
        assert!(FileChunk::plan_for(0, 5).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_resets_unconfirmed_success() {
        let mut transfer = UploadTransfer::new("a.bin", 40, "x", 10).unwrap();
        transfer.chunks[0].mark_success();
        transfer.chunks[1].mark_success();

        // Server holds part 1 only (index 0).
        transfer.reconcile(&[0]);

        assert_eq!(
            statuses(&transfer),
            vec![
                ChunkStatus::Success,
                ChunkStatus::Pending,
                ChunkStatus::Pending,
                ChunkStatus::Pending
            ]
        );
    }

    #[test]
    fn test_reconcile_adopts_server_parts() {
        let mut transfer = UploadTransfer::new("a.bin", 40, "x", 10).unwrap();
        transfer.chunks[1].status = ChunkStatus::Uploading;
        transfer.chunks[2].status = ChunkStatus::Error;
        transfer.chunks[2].last_error = Some("timeout".to_string());
        transfer.chunks[3].status = ChunkStatus::Error;

        transfer.reconcile(&[2]);

        assert_eq!(
            statuses(&transfer),
            vec![
                ChunkStatus::Pending,
                ChunkStatus::Pending,
                ChunkStatus::Success,
                ChunkStatus::Error
            ]
        );
        assert_eq!(transfer.chunks[2].last_error, None);
        assert_eq!(transfer.failed_chunks(), vec![3]);
        assert_eq!(transfer.progress(), 0.25);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.json");

        let mut transfer = UploadTransfer::new("a.bin", 25, "x", 10).unwrap();
        transfer.session_id = Some("session-1".to_string());
        transfer.chunks[0].mark_success();
        transfer.save(&path).await.unwrap();

        let loaded = UploadTransfer::load(&path).await.unwrap();
        assert_eq!(loaded.session_id.as_deref(), Some("session-1"));
        assert_eq!(loaded.chunks, transfer.chunks);
    }
}
