//! Chunk planning
//!
//! Splits a file into contiguous byte ranges. The partition depends only on
//! the file size and chunk size, so a client that reloads can rebuild the
//! exact chunk list and line its indices up with the server's part numbers.

use serde::{Deserialize, Serialize};

/// One planned byte range, `start..end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// 0-based chunk index; the server part number is `index + 1`
    pub index: usize,
    pub start: u64,
    /// Exclusive end offset
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition `file_size` bytes into chunks of `chunk_size`; the last chunk
/// holds the remainder. A zero chunk size yields an empty plan.
pub fn plan(file_size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    if chunk_size == 0 {
        return Vec::new();
    }

    let count = file_size.div_ceil(chunk_size) as usize;
    (0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            ChunkRange {
                index,
                start,
                end: (start + chunk_size).min(file_size),
            }
        })
        .collect()
}
