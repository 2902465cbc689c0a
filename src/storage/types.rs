//! Storage types

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// A part that has landed in the backend, as handed to `complete_multipart`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    /// 1-based part number
    pub part_number: u32,
    /// Opaque tag returned by `upload_part` (an ETag on S3)
    pub completion_tag: String,
}

/// Multipart-upload primitive of an object-storage backend.
///
/// Every call is assumed atomic; callers own retry and ordering decisions.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Start a multipart upload and return the backend's upload handle
    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> StorageResult<String>;

    /// Store one part and return its completion tag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String>;

    /// Assemble the object from `parts`, which must be ordered by part number.
    /// Returns the final location of the object.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<String>;

    /// Discard a multipart upload and every part stored for it
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()>;
}
