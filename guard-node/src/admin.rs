use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::proxy::{proxy_handler, AppState};

/// Header carrying the admin API key.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Deserialize)]
pub struct BlocklistRequest {
    pub ip: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Assemble the full application router: the admin contract, the metrics
/// and health surfaces, and the catch-all proxy fallback.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/admin/state", get(admin_state))
        .route("/admin/blocklist", post(add_blocklist))
        .route("/admin/blocklist/:ip", delete(remove_blocklist))
        .route("/telemetry/events", get(telemetry_events))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_admin,
        ));

    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health))
        .merge(admin)
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject any admin request whose API key header does not match the
/// configured token. An unset token closes the admin surface entirely.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    match (state.config.admin_api_key.as_deref(), provided) {
        (Some(expected), Some(token)) if token == expected => next.run(request).await,
        _ => {
            warn!("admin request rejected, invalid or missing API key");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "Invalid or missing admin API key" })),
            )
                .into_response()
        }
    }
}

async fn admin_state(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = state.pipeline.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Detection pipeline unavailable" })),
        )
            .into_response();
    };
    let snapshot = pipeline.store.snapshot(None);
    let blocklist: Vec<String> = pipeline
        .detector
        .blocklist_ips()
        .iter()
        .map(IpAddr::to_string)
        .collect();
    Json(json!({
        "window_seconds": state.config.sliding_window_seconds,
        "request_rate_limit": state.config.request_rate_limit,
        "unique_ip_count": snapshot.unique_ip_count,
        "global_request_rate": snapshot.global_request_rate,
        "global_event_count": snapshot.global_event_count,
        "blocklist_ips": blocklist,
    }))
    .into_response()
}

async fn add_blocklist(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BlocklistRequest>,
) -> Response {
    let Some(pipeline) = state.pipeline.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Detection pipeline unavailable" })),
        )
            .into_response();
    };
    let Some(normalized) = crate::resolver::normalize_ip(&request.ip) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "Invalid IP address" })),
        )
            .into_response();
    };
    pipeline.detector.add_to_blocklist(normalized);
    (
        StatusCode::CREATED,
        Json(json!({
            "ip": normalized.to_string(),
            "message": request.reason.unwrap_or_else(|| "added".to_string()),
        })),
    )
        .into_response()
}

async fn remove_blocklist(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Response {
    let Some(pipeline) = state.pipeline.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Detection pipeline unavailable" })),
        )
            .into_response();
    };
    let Some(normalized) = crate::resolver::normalize_ip(&ip) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "Invalid IP address" })),
        )
            .into_response();
    };
    pipeline.detector.remove_from_blocklist(normalized);
    Json(json!({ "ip": normalized.to_string(), "removed": true })).into_response()
}

async fn telemetry_events(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "events": state.telemetry.recent(None) })).into_response()
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    let Some(handle) = state.metrics_handle.as_ref() else {
        return (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response();
    };
    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn health() -> Response {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") })).into_response()
}
