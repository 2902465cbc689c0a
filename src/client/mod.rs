//! Upload Client
//!
//! Splits a local file into chunks and drives them through the session
//! protocol with bounded parallelism, retries and resume.

pub mod api;
pub mod controller;
pub mod planner;
pub mod retry;
pub mod source;
pub mod types;

pub use api::{HttpUploadApi, UploadApi};
pub use controller::{ControllerConfig, UploadController};
pub use planner::{plan, ChunkRange};
pub use retry::RetryPolicy;
pub use source::{ChunkSource, FileSource};
pub use types::*;
