//! Resumable Upload Server
//!
//! Chunked, resumable uploads of large files into S3-compatible object
//! storage, with an upload client that drives the protocol from the other end.

pub mod client;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
