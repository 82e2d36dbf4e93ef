//! HTTP routes for homeserver pushes.
//!
//! hyper handles framing (keep-alive, chunked bodies). The router caps body
//! size and puts a deadline on each request.

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

use super::AppService;

/// Upper bound on a request body.
pub const MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;

/// Time allowed for reading a request body and handling it.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transaction push endpoint.
pub const TRANSACTIONS_PATH: &str = "/_matrix/app/v1/transactions/{txn_id}";

/// Liveness check.
pub const LIVE_PATH: &str = "/_matrix/mau/live";

/// Readiness check, 503 until the bridge has started.
pub const READY_PATH: &str = "/_matrix/mau/ready";

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

/// Error in the Matrix `{errcode, error}` shape.
pub fn matrix_error(status: StatusCode, errcode: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({ "errcode": errcode, "error": message.into() }))).into_response()
}

/// Empty JSON object with the given status.
pub fn empty(status: StatusCode) -> Response {
    (status, Json(json!({}))).into_response()
}

/// Router serving `service`.
pub fn router(service: Arc<AppService>) -> Router {
    let timeout = service.request_timeout;
    Router::new()
        .route(TRANSACTIONS_PATH, put(put_transaction).fallback(method_not_allowed))
        .route(LIVE_PATH, get(live).fallback(method_not_allowed))
        .route(READY_PATH, get(ready).fallback(method_not_allowed))
        .fallback(unrecognized)
        .layer(middleware::from_fn(move |request: Request, next: Next| {
            with_deadline(timeout, request, next)
        }))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_SIZE))
        .with_state(service)
}

async fn with_deadline(timeout: Duration, request: Request, next: Next) -> Response {
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => matrix_error(StatusCode::REQUEST_TIMEOUT, "M_UNKNOWN", "request timed out"),
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn put_transaction(
    State(service): State<Arc<AppService>>,
    Path(txn_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = bearer(&headers).or(query.access_token.as_deref());
    service.handle_transaction(token, &txn_id, &body)
}

async fn live() -> Response {
    empty(StatusCode::OK)
}

async fn ready(State(service): State<Arc<AppService>>) -> Response {
    if service.is_ready() {
        empty(StatusCode::OK)
    } else {
        empty(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn method_not_allowed() -> Response {
    matrix_error(StatusCode::METHOD_NOT_ALLOWED, "M_UNRECOGNIZED", "method not allowed")
}

async fn unrecognized() -> Response {
    matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "unrecognized request")
}
