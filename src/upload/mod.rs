//! Resumable Upload Module
//!
//! Server side of the chunked multipart protocol:
//! - Per-session state machine (Pending, Uploading, Completed, Failed, Cancelled)
//! - Idempotent part acceptance and completion
//! - Periodic sweep of expired sessions
//!
//! Protocol Flow:
//! 1. Client initiates a session; a backend multipart upload is opened
//! 2. Client uploads chunks in any order, any number of times
//! 3. Client queries status to learn which chunks landed (resume)
//! 4. Client completes; the backend assembles parts in part-number order

pub mod service;
pub mod store;
pub mod types;

pub use service::{SessionService, SessionSettings};
pub use store::{SessionHandle, SessionStore};
pub use types::*;
