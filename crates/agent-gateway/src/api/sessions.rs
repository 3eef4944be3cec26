//! Session lifecycle endpoints — create, inspect, list, close, resume.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::api::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(default)]
    pub subdir: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    match state
        .sessions
        .create(&body.user_id, body.subdir.as_deref(), body.metadata)
        .await
    {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Enumerates session ids, optionally filtered by `user_id` — per §4.2's
/// Metadata Store contract and §4.6's wire schema, this returns bare ids
/// rather than full session records.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> impl IntoResponse {
    match state.sessions.list(query.user_id.as_deref()).await {
        Ok(sessions) => {
            let ids: Vec<String> = sessions.into_iter().map(|s| s.session_id).collect();
            Json(ids).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn get(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get(&session_id).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn close(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.close(&session_id).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Re-admit a session that has no live subprocess (spawns one eagerly
/// instead of waiting for the next chat turn to do it implicitly).
pub async fn resume(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.resume_eager(&session_id).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}
