//! Ingress-layer errors: bind/upgrade failures and the poll/WS HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Failures that can occur standing up the listener itself.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Failed to bind the configured port.
    #[error("failed to bind to {0}: {1}")]
    Bind(std::net::SocketAddr, #[source] std::io::Error),

    /// The `axum::serve` future itself returned an error.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// The four rejection shapes `/ws` can answer with outside of the normal
/// socket/poll paths.
pub enum IngressRejection {
    /// Missing or invalid `uid` query parameter.
    MissingUid,
    /// `Origin` header present but not an allowed host.
    ForbiddenOrigin,
    /// Any method on `/ws` other than `GET`/`OPTIONS`.
    MethodNotAllowed,
    /// Any path other than `/ws`.
    NotFound,
}

impl IntoResponse for IngressRejection {
    fn into_response(self) -> Response {
        match self {
            IngressRejection::MissingUid => {
                (StatusCode::BAD_REQUEST, axum::Json(json!({"error": "uid is required"}))).into_response()
            }
            IngressRejection::ForbiddenOrigin => StatusCode::FORBIDDEN.into_response(),
            IngressRejection::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
            IngressRejection::NotFound => StatusCode::NOT_FOUND.into_response(),
        }
    }
}
