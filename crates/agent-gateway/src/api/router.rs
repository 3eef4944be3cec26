//! Route table. `/health` is unauthenticated; everything under
//! `/api/v1` requires the bearer token (when configured).

use axum::routing::{get, post};
use axum::{middleware, Router};

use crate::api::{chat, health, sessions};
use crate::auth::require_api_token;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/sessions", post(sessions::create).get(sessions::list))
        .route(
            "/sessions/:id",
            get(sessions::get).delete(sessions::close),
        )
        .route("/sessions/:id/resume", post(sessions::resume))
        .route("/chat", post(chat::chat))
        .route("/chat/stream", post(chat::chat_stream))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/health", get(health::health))
        .nest("/api/v1", api)
        .with_state(state)
}
