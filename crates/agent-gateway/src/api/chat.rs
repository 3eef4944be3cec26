//! Chat endpoints — the primary interface for running agent turns.
//!
//! - `POST /api/v1/chat`        — non-streaming: returns the full response
//! - `POST /api/v1/chat/stream` — SSE: streams deltas and tool activity

use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;

use ag_domain::agent_event::AgentEvent;
use ag_domain::error::Error;

use crate::api::error_response;
use crate::session_manager::{ChatOutcome, SessionManager};
use crate::state::AppState;
use crate::stream_translator::{to_sse_json, ChatAccumulator};

const EVENT_RELAY_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

/// Drive one turn to completion on its own detached task, forwarding
/// each event into `tx` as it arrives. Spawned rather than awaited
/// directly by the HTTP handler so that an HTTP caller disconnecting
/// mid-turn — dropping its side of `tx`'s receiver — does not cancel the
/// turn: the agent subprocess's event reader keeps running regardless,
/// and `message_count`/`last_active_at` bookkeeping still lands.
fn spawn_turn_driver(
    sessions: Arc<SessionManager>,
    outcome: ChatOutcome,
    tx: mpsc::Sender<AgentEvent>,
) {
    tokio::spawn(async move {
        let ChatOutcome {
            session_id,
            mut stream,
            _permit,
        } = outcome;
        while let Some(event) = stream.next().await {
            let is_done = event.is_done();
            // Ignore send errors: a disconnected caller only means
            // nobody is listening, not that the turn should stop.
            let _ = tx.send(event).await;
            if is_done {
                break;
            }
        }
        if let Err(e) = sessions.record_turn_completed(&session_id).await {
            tracing::warn!(%session_id, error = %e, "failed to persist turn bookkeeping");
        }
        // `_permit` drops here, releasing the session lock and the
        // fleet-wide concurrency permit — only once the turn is fully done.
    });
}

/// `POST /api/v1/chat` — drains the turn's events and returns the
/// accumulated response as one JSON body.
pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let session_id = body.session_id.clone();
    let outcome = match state.sessions.chat(&body.session_id, &body.message).await {
        Ok(outcome) => outcome,
        Err(e) => return error_response(e),
    };

    let (tx, mut rx) = mpsc::channel(EVENT_RELAY_CAPACITY);
    spawn_turn_driver(state.sessions.clone(), outcome, tx);

    let mut acc = ChatAccumulator::new();
    while let Some(event) = rx.recv().await {
        if acc.push(&event) {
            break;
        }
    }

    Json(acc.into_response(&session_id, chrono::Utc::now())).into_response()
}

/// `POST /api/v1/chat/stream` — SSE stream of translated `AgentEvent`s.
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let outcome = match state.sessions.chat(&body.session_id, &body.message).await {
        Ok(outcome) => outcome,
        Err(e) => return sse_error(e),
    };

    let (tx, rx) = mpsc::channel(EVENT_RELAY_CAPACITY);
    spawn_turn_driver(state.sessions.clone(), outcome, tx);

    Sse::new(relay_as_sse(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_error(err: Error) -> axum::response::Response {
    let status = match &err {
        Error::NotFound(_) => axum::http::StatusCode::NOT_FOUND,
        Error::SessionBusy(_) => axum::http::StatusCode::CONFLICT,
        Error::QuotaExceeded(_) => axum::http::StatusCode::TOO_MANY_REQUESTS,
        Error::Overloaded(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
        _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "detail": err.to_string(), "kind": err.kind() })),
    )
        .into_response()
}

/// Consumer side of the relay channel: translates each event to its SSE
/// record. If the caller disconnects, axum simply stops polling this
/// stream — the `spawn_turn_driver` task keeps draining the agent and
/// completing the turn regardless, per spec.md §5's cancellation rule.
fn relay_as_sse(
    mut rx: mpsc::Receiver<AgentEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let is_done = event.is_done();
            yield Ok(Event::default().data(to_sse_json(&event).to_string()));
            if is_done {
                break;
            }
        }
    }
}
