//! REST API Handlers
//!
//! Carries the dispatch envelope over HTTP. The body of every dock response
//! is the envelope and the status code mirrors the envelope code.

use crate::controlplane::dispatch::{BackendStatus, Dock, DockRequest, Reply};
use crate::error::Error;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

// =============================================================================
// Response Types
// =============================================================================

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backends: Vec<BackendStatus>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    dock: Arc<Dock>,
    max_body_size: usize,
}

impl RestRouter {
    pub fn new(dock: Arc<Dock>, max_body_size: usize) -> Self {
        Self {
            dock,
            max_body_size,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState { dock: self.dock };

        Router::new()
            .route("/v1/dock", post(dispatch))
            .route("/v1/dock/:backend/:operation", post(dispatch_operation))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    dock: Arc<Dock>,
}

// =============================================================================
// Handlers
// =============================================================================

fn reply_response(reply: Reply) -> Response {
    let status =
        StatusCode::from_bytes(reply.code().as_bytes()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply)).into_response()
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> std::result::Result<T, Reply> {
    serde_json::from_slice(body).map_err(|e| {
        Reply::from_error(&Error::InvalidArgument(format!("malformed request body: {}", e)))
    })
}

/// Dispatch a full request record
async fn dispatch(State(state): State<AppState>, body: Bytes) -> Response {
    let request: DockRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(reply) => return reply_response(reply),
    };

    debug!(
        "REST dispatch {} on backend {}",
        request.operation, request.backend
    );
    reply_response(state.dock.dispatch_request(request).await)
}

/// Dispatch with backend and operation taken from the path and params as the body
async fn dispatch_operation(
    State(state): State<AppState>,
    Path((backend, operation)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let params = if body.is_empty() {
        serde_json::Value::Null
    } else {
        match parse_body(&body) {
            Ok(params) => params,
            Err(reply) => return reply_response(reply),
        }
    };

    debug!("REST dispatch {} on backend {}", operation, backend);
    reply_response(state.dock.dispatch(&backend, &operation, params).await)
}

fn health(state: &AppState) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        version: crate::VERSION.into(),
        backends: state.dock.status(),
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(health(&state)))
}

/// Ready once every backend finished driver setup
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = health(&state);
    if body.backends.iter().all(|b| b.initialized) {
        (StatusCode::OK, Json(body))
    } else {
        body.status = "initializing".into();
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendProperties, DockConfig};
    use crate::controlplane::registry::init_registry;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn router(start: bool) -> Router {
        let dock = Dock::new(DockConfig::default(), Arc::new(init_registry())).unwrap();
        if start {
            dock.start().await.unwrap();
        } else {
            dock.register_backend("sample", &BackendProperties::sample())
                .unwrap();
        }
        RestRouter::new(dock, 1024 * 1024).build()
    }

    async fn send(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_dispatch_request_record() {
        let app = router(true).await;
        let body = json!({"backend": "sample", "operation": "list_pools"}).to_string();

        let (status, reply) = send(app, "POST", "/v1/dock", &body).await;
        assert_eq!(status, StatusCode::OK);
        let message = reply["Result"]["message"].as_str().unwrap();
        let pools: serde_json::Value = serde_json::from_str(message).unwrap();
        assert_eq!(pools[0]["name"], "sample-pool-01");
    }

    #[tokio::test]
    async fn test_status_mirrors_envelope_code() {
        let (status, reply) = send(router(true).await, "POST", "/v1/dock/sample/resize_pool", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["Error"]["description"], "no action: resize_pool");

        let (status, reply) = send(
            router(true).await,
            "POST",
            "/v1/dock/sample/delete_file_share",
            r#"{"id":"e1bb066c-5ce7-46eb-9336-25508cee9f71"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(reply["Error"]["code"], "501");
    }

    #[tokio::test]
    async fn test_malformed_body_is_envelope_error() {
        let (status, reply) = send(router(true).await, "POST", "/v1/dock", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["Error"]["code"], "400");
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (status, body) = send(router(false).await, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backends"][0]["name"], "sample");

        let (status, body) = send(router(false).await, "GET", "/ready", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "initializing");

        let (status, _) = send(router(true).await, "GET", "/ready", "").await;
        assert_eq!(status, StatusCode::OK);
    }
}
