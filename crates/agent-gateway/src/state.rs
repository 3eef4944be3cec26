//! Shared application state passed to every HTTP handler.

use std::sync::Arc;
use std::time::Instant;

use ag_domain::config::Config;

use crate::session_manager::SessionManager;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    /// SHA-256 of the configured bearer token. `None` means auth is
    /// disabled (local/dev mode).
    pub api_token_hash: Arc<Option<Vec<u8>>>,
    pub started_at: Instant,
    pub storage_label: &'static str,
}
