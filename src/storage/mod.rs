//! Storage module for S3-compatible backends
//!
//! Supports MinIO, Cloudflare R2, Backblaze B2 and AWS S3 through [`S3Client`],
//! plus an in-process [`MemoryStorage`] for local runs and tests.

mod memory;
mod s3_client;
mod types;

pub use memory::{MemoryStorage, StorageCallCounts, StoredObject};
pub use s3_client::S3Client;
pub use types::*;
