//! Error types shared across the server

use thiserror::Error;

/// Storage-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A non-final part was smaller than the backend minimum
    #[error("Part too small: {0}")]
    PartTooSmall(String),

    #[error("Multipart upload not found: {0}")]
    UploadNotFound(String),

    #[error("S3 SDK error: {0}")]
    SdkError(String),
}

/// Storage result type
pub type StorageResult<T> = std::result::Result<T, StorageError>;
