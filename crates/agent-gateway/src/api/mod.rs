pub mod chat;
pub mod health;
pub mod router;
pub mod sessions;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use ag_domain::error::Error;

/// Maps every [`Error`] variant to exactly one HTTP status, with a JSON
/// body carrying the machine-readable `kind` tag and a human `detail`
/// message, per spec §7.
pub fn error_response(err: Error) -> axum::response::Response {
    let status = match &err {
        Error::InvalidInput(_) | Error::PathEscape(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::SessionBusy(_) => StatusCode::CONFLICT,
        Error::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::StorageBroken(_) | Error::Io(_) | Error::Json(_) | Error::Fatal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(kind = err.kind(), "internal error: {err}");
    }

    (
        status,
        Json(json!({ "detail": err.to_string(), "kind": err.kind() })),
    )
        .into_response()
}
