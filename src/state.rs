//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::SessionService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    sessions: SessionService,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, sessions: SessionService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, sessions }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload session service
    pub fn sessions(&self) -> &SessionService {
        &self.inner.sessions
    }
}
