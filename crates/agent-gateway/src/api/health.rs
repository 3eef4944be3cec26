//! `GET /health` — liveness/readiness probe.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let live_clients = state.sessions.live_client_count();
    let persisted_sessions = state.sessions.list(None).await.map(|s| s.len()).ok();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": {
            "live_clients": live_clients,
            "persisted_sessions": persisted_sessions,
        },
        "storage_type": state.storage_label,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "rss_mb": state.sessions.estimate_fleet_rss_mb(),
        "limits": {
            "max_sessions": state.config.sessions.max_sessions,
            "max_sessions_per_user": state.config.sessions.max_sessions_per_user,
            "max_concurrent_requests": state.config.sessions.max_concurrent_requests,
            "memory_limit_mb": state.config.sessions.memory_limit_mb,
        },
    }))
}
