//! Shared error taxonomy used across all agent-gateway crates.
//!
//! Each variant maps to exactly one HTTP status at the surface layer
//! (see `ag_gateway::api`); component-level code returns this type and
//! never the raw `std::io::Error` / `serde_json::Error` it wraps.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Caller-visible, 400. Malformed `user_id`, absent `message`, etc.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Path normalized outside `base_dir/user_id`. 400.
    #[error("path escapes base directory: {0}")]
    PathEscape(String),

    /// Session id not in store, or resume target absent. 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Per-session lock already held. 409.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// Would breach max_sessions_per_user. 429.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Would breach max_sessions, memory_limit_mb, or max_concurrent_requests. 429/503.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Transient storage backend error, retryable. 503.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Fatal storage contract violation, surfaced at startup.
    #[error("storage broken: {0}")]
    StorageBroken(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected; logged with full context, 500 to the caller.
    #[error("internal: {0}")]
    Fatal(String),
}

impl Error {
    /// A short machine-readable tag, used in JSON error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::PathEscape(_) => "path_escape",
            Error::NotFound(_) => "not_found",
            Error::SessionBusy(_) => "session_busy",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::Overloaded(_) => "overloaded",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::StorageBroken(_) => "storage_broken",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Fatal(_) => "fatal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
