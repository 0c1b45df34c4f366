//! HTTP/WebSocket ingress glue for `/ws`.
//!
//! Out of scope for the run coordinator proper; this module is the thin
//! layer that turns an inbound connection into calls against [`Coordinator`].

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::any,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::{coordinator::Coordinator, error::{IngressRejection, ServeError}, ws};

const ALLOWED_HOSTS: &[&str] = &["sune.planetrenox.com", "sune.chat"];

#[derive(Debug, Deserialize)]
struct WsQuery {
    uid: Option<String>,
}

/// Top-level config for [`serve`].
pub struct ServeConfig {
    /// Socket address to bind.
    pub listen_address: SocketAddr,
    /// Shared coordinator state.
    pub coordinator: Arc<Coordinator>,
    /// Cancelled to trigger graceful shutdown.
    pub shutdown_signal: CancellationToken,
}

/// Build the router and serve it until `shutdown_signal` is cancelled.
pub async fn serve(
    ServeConfig {
        listen_address,
        coordinator,
        shutdown_signal,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(86_400));

    let app = Router::new()
        .route("/ws", any(ws_endpoint))
        .fallback(not_found)
        .layer(cors)
        .with_state(coordinator);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| ServeError::Bind(listen_address, e))?;

    log::info!("sune-proxy listening on http://{listen_address}/ws");

    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result.map_err(ServeError::Serve)?;
        }
        _ = shutdown_signal.cancelled() => {
            log::info!("received shutdown signal, shutting down gracefully");
        }
    }

    Ok(())
}

async fn not_found() -> IngressRejection {
    IngressRejection::NotFound
}

async fn ws_endpoint(
    State(coordinator): State<Arc<Coordinator>>,
    method: Method,
    Query(query): Query<WsQuery>,
    headers: axum::http::HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> axum::response::Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        if !origin_is_allowed(origin) {
            return IngressRejection::ForbiddenOrigin.into_response();
        }
    }

    match method {
        Method::OPTIONS => StatusCode::NO_CONTENT.into_response(),
        Method::GET => {
            let Some(uid) = sanitize_uid(query.uid.as_deref()) else {
                return IngressRejection::MissingUid.into_response();
            };

            match ws {
                Some(upgrade) => upgrade
                    .on_upgrade(move |socket| ws::handle_socket(socket, uid, coordinator))
                    .into_response(),
                None => {
                    let response = coordinator.poll(&uid).await;
                    axum::Json(response).into_response()
                }
            }
        }
        _ => IngressRejection::MethodNotAllowed.into_response(),
    }
}

/// `uid` must be non-empty once trimmed to 64 chars and `[A-Za-z0-9_-]` only.
fn sanitize_uid(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let trimmed: String = raw.chars().take(64).collect();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    Some(trimmed)
}

/// `Origin`, when present, must hostname-match an allowed host or any
/// `*.github.io` subdomain.
fn origin_is_allowed(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else { return false };
    let Ok(parsed) = url::Url::parse(origin) else { return false };
    let Some(host) = parsed.host_str() else { return false };

    ALLOWED_HOSTS.contains(&host) || host.ends_with(".github.io")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_is_trimmed_to_64_chars_and_restricted_to_safe_characters() {
        assert_eq!(sanitize_uid(Some("abc-123_XYZ")), Some("abc-123_XYZ".to_string()));
        assert_eq!(sanitize_uid(Some("")), None);
        assert_eq!(sanitize_uid(None), None);
        assert_eq!(sanitize_uid(Some("has a space")), None);
        assert_eq!(sanitize_uid(Some("has/a/slash")), None);

        let long = "a".repeat(100);
        assert_eq!(sanitize_uid(Some(&long)).unwrap().len(), 64);
    }

    #[test]
    fn origin_allows_configured_hosts_and_github_io_subdomains() {
        assert!(origin_is_allowed(&HeaderValue::from_static("https://sune.chat")));
        assert!(origin_is_allowed(&HeaderValue::from_static("https://sune.planetrenox.com")));
        assert!(origin_is_allowed(&HeaderValue::from_static("https://someuser.github.io")));
        assert!(!origin_is_allowed(&HeaderValue::from_static("https://evil.example.com")));
    }
}
