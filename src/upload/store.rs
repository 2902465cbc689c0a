//! Upload Session Store
//!
//! Authoritative in-memory state of every in-flight upload.
//!
//! The map lock is only held to look up, insert or remove an entry. Every
//! read-modify-write of a session happens under that session's own mutex, so
//! requests for different sessions never wait on each other. Code that holds
//! an entry lock may take the map lock (to remove the entry); the reverse order
//! is never used.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::types::{SessionStatus, UploadSession};

/// Shared, individually locked session
pub type SessionHandle = Arc<Mutex<UploadSession>>;

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new session and return its handle
    pub async fn insert(&self, session: UploadSession) -> SessionHandle {
        let id = session.id.clone();
        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, handle.clone());
        handle
    }

    /// Handle for a session, if it is still stored
    pub async fn handle(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Read-only copy of a session
    pub async fn snapshot(&self, id: &str) -> Option<UploadSession> {
        let handle = self.handle(id).await?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Drop a session from the store
    pub async fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(id)
    }

    /// Every stored session handle, for scans such as the expiry sweep
    pub async fn handles(&self) -> Vec<(String, SessionHandle)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    /// Get session count
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sessions still waiting for parts
    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for (_, handle) in self.handles().await {
            let session = handle.lock().await;
            if matches!(session.status, SessionStatus::Pending | SessionStatus::Uploading) {
                count += 1;
            }
        }
        count
    }
}
