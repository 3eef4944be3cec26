//! API authentication middleware.
//!
//! Reads the env var named by `config.server.api_token_env` once at
//! startup and caches the SHA-256 digest in [`AppState`]. If the env
//! var is unset or empty, the server logs a warning once and allows
//! unauthenticated access (dev mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Compute the bearer-token hash once at startup, from the env var named
/// by `api_token_env`. `None` disables auth.
pub fn compute_token_hash(api_token_env: &str) -> Option<Vec<u8>> {
    match std::env::var(api_token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var = api_token_env, "API bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = api_token_env,
                "API bearer-token auth DISABLED — set this variable to enable"
            );
            None
        }
    }
}

/// Axum middleware enforcing bearer-token auth on protected routes.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match state.api_token_hash.as_ref() {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "detail": "invalid or missing API token" })),
        )
            .into_response();
    }

    next.run(req).await
}
