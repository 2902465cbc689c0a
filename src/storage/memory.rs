//! In-memory multipart storage
//!
//! Behaves like an S3 bucket for a single process: parts are held until the
//! upload is completed or aborted, completion tags are content hashes, and
//! non-final parts below the minimum size are refused at completion time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

use super::types::{CompletedPart, StorageAdapter};

/// Number of calls made against each multipart operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCallCounts {
    pub initiate: usize,
    pub upload_part: usize,
    pub complete: usize,
    pub abort: usize,
}

#[derive(Default)]
struct Counters {
    initiate: AtomicUsize,
    upload_part: AtomicUsize,
    complete: AtomicUsize,
    abort: AtomicUsize,
}

struct PendingUpload {
    key: String,
    content_type: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// An object assembled by `complete_multipart`
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub data: Bytes,
}

/// Process-local storage backend
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryStorageInner>,
}

struct MemoryStorageInner {
    bucket: String,
    min_part_size: u64,
    uploads: RwLock<HashMap<String, PendingUpload>>,
    objects: RwLock<HashMap<String, StoredObject>>,
    counters: Counters,
}

impl MemoryStorage {
    /// Create a backend that enforces `min_part_size` on every non-final part
    pub fn new(bucket: impl Into<String>, min_part_size: u64) -> Self {
        Self {
            inner: Arc::new(MemoryStorageInner {
                bucket: bucket.into(),
                min_part_size,
                uploads: RwLock::new(HashMap::new()),
                objects: RwLock::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Snapshot of the per-operation call counters
    pub fn call_counts(&self) -> StorageCallCounts {
        let c = &self.inner.counters;
        StorageCallCounts {
            initiate: c.initiate.load(Ordering::SeqCst),
            upload_part: c.upload_part.load(Ordering::SeqCst),
            complete: c.complete.load(Ordering::SeqCst),
            abort: c.abort.load(Ordering::SeqCst),
        }
    }

    /// Fetch a completed object
    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.inner.objects.read().await.get(key).cloned()
    }

    /// Number of multipart uploads neither completed nor aborted
    pub async fn pending_upload_count(&self) -> usize {
        self.inner.uploads.read().await.len()
    }
}

fn completion_tag(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: &str,
        _metadata: &HashMap<String, String>,
    ) -> StorageResult<String> {
        self.inner.counters.initiate.fetch_add(1, Ordering::SeqCst);

        let upload_id = Uuid::new_v4().simple().to_string();
        self.inner.uploads.write().await.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        self.inner.counters.upload_part.fetch_add(1, Ordering::SeqCst);

        let mut uploads = self.inner.uploads.write().await;
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::UploadNotFound(upload_id.to_string()))?;

        let tag = completion_tag(&data);
        upload.parts.insert(part_number, (tag.clone(), data));
        Ok(tag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<String> {
        self.inner.counters.complete.fetch_add(1, Ordering::SeqCst);

        let mut uploads = self.inner.uploads.write().await;
        let upload = uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::UploadNotFound(upload_id.to_string()))?;

        let mut assembled = BytesMut::new();
        let mut previous = 0;
        for (position, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(StorageError::SdkError(format!(
                    "Parts out of order at part {}",
                    part.part_number
                )));
            }
            previous = part.part_number;

            let (tag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::SdkError(format!("Part {} was never uploaded", part.part_number))
            })?;
            if *tag != part.completion_tag {
                return Err(StorageError::SdkError(format!(
                    "Completion tag mismatch for part {}",
                    part.part_number
                )));
            }

            let is_last = position + 1 == parts.len();
            if !is_last && (data.len() as u64) < self.inner.min_part_size {
                return Err(StorageError::PartTooSmall(format!(
                    "Part {} is {} bytes, minimum is {}",
                    part.part_number,
                    data.len(),
                    self.inner.min_part_size
                )));
            }
            assembled.extend_from_slice(data);
        }

        let content_type = upload.content_type.clone();
        uploads.remove(upload_id);
        drop(uploads);

        self.inner.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                content_type,
                data: assembled.freeze(),
            },
        );

        Ok(format!("memory://{}/{}", self.inner.bucket, key))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.inner.counters.abort.fetch_add(1, Ordering::SeqCst);

        let mut uploads = self.inner.uploads.write().await;
        match uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(StorageError::UploadNotFound(upload_id.to_string())),
        }
    }
}
