//! HTTP surface: every incoming request is intercepted and routed through
//! the cache

use crate::AppState;
use crate::cache::{CacheError, RequestKey};
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};

/// Headers that describe the connection, not the payload; never replayed
/// from the store or forwarded from the upstream
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .fallback(handle_proxy)
        .layer(CorsLayer::permissive()) // Allow CORS for all origins during development
        .with_state(state)
}

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "state": format!("{:?}", state.controller.state()),
        "generation": state.controller.generation().as_str(),
        "upstream": state.config.upstream_origin,
    }))
}

/// Intercept one request, resolve it against the upstream origin, and route
/// it cache-first
async fn handle_proxy(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().as_str().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let url = format!("{}{}", state.config.upstream_origin, path_and_query);
    let key = RequestKey::new(method, url);
    debug!("Intercepted {}", key);

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(bytes.to_vec()),
        Err(e) => {
            warn!("Failed to read request body for {}: {}", key, e);
            return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
        }
    };

    match state.router.route(key, body).await {
        // Write-back (if any) continues in the background after the handle
        // is dropped here
        Ok(routed) => to_http_response(routed.status, routed.headers, routed.body),
        Err(CacheError::NetworkUnavailable { url, reason }) => {
            warn!("Upstream unreachable for {}: {}", url, reason);
            (StatusCode::BAD_GATEWAY, format!("Upstream unreachable: {}", reason)).into_response()
        }
        Err(e) => {
            error!("Routing failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Routing failed: {}", e)).into_response()
        }
    }
}

fn to_http_response(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to assemble response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to assemble response").into_response()
        }
    }
}
