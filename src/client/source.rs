//! Chunk sources
//!
//! Where the controller reads chunk bytes from. Each read is independent so
//! several workers can read different ranges at the same time.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::types::ClientError;

/// Random-access byte source for a transfer
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Total size in bytes
    fn size(&self) -> u64;

    /// Read `start..end`
    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes, ClientError>;
}

fn check_range(start: u64, end: u64, size: u64) -> Result<(), ClientError> {
    if start > end || end > size {
        return Err(ClientError::Validation(format!(
            "Range {}..{} outside source of {} bytes",
            start, end, size
        )));
    }
    Ok(())
}

#[async_trait]
impl ChunkSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes, ClientError> {
        check_range(start, end, self.size())?;
        Ok(self.slice(start as usize..end as usize))
    }
}

/// A file on local disk, opened per read
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ClientError::Validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes, ClientError> {
        check_range(start, end, self.size)?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
