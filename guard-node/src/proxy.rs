use axum::body::{self, Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use ipnet::IpNet;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{GuardConfig, SensitivityLevel};
use crate::detector::DetectionEngine;
use crate::error::Result;
use crate::features::FeatureExtractor;
use crate::mitigation::{MitigationController, ACTIVE_BLOCK_RULE, BASELINE_RULE};
use crate::prediction::PredictionService;
use crate::resolver;
use crate::telemetry::{TelemetrySink, DEFAULT_MAX_EVENTS};
use crate::types::{MitigationAction, MitigationOutcome, Prediction, TrafficSample, Verdict};
use crate::upstream::UpstreamClient;
use crate::window::SlidingWindowStore;

/// Background sweep cadence for the window store and mitigation state.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// The detection pipeline; absent in soft-degraded mode, in which case all
/// traffic passes with a one-time warning.
pub struct DetectionPipeline {
    pub store: Arc<SlidingWindowStore>,
    pub extractor: FeatureExtractor,
    pub prediction: Arc<PredictionService>,
    pub detector: Arc<DetectionEngine>,
    pub mitigation: Arc<MitigationController>,
}

/// Everything the request handler and admin surface share.
pub struct AppState {
    pub config: GuardConfig,
    pub sensitivity: SensitivityLevel,
    pub trusted_proxies: Vec<IpNet>,
    pub pipeline: Option<DetectionPipeline>,
    pub upstream: UpstreamClient,
    pub telemetry: TelemetrySink,
    pub metrics_handle: Option<PrometheusHandle>,
    degraded_warned: AtomicBool,
}

impl AppState {
    /// Construct the full pipeline leaves-first from a validated
    /// configuration. Must run inside a Tokio runtime.
    pub fn from_config(
        config: GuardConfig,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(SlidingWindowStore::new(config.sliding_window_seconds)?);
        let extractor = FeatureExtractor::new(Arc::clone(&store));
        let prediction = Arc::new(PredictionService::new(&config));
        let detector = Arc::new(DetectionEngine::new(&config)?);
        let mitigation = Arc::new(MitigationController::new(&config));
        let pipeline = DetectionPipeline {
            store,
            extractor,
            prediction,
            detector,
            mitigation,
        };
        Self::assemble(config, Some(pipeline), metrics_handle)
    }

    /// Soft-degraded state with no detection pipeline; every request is
    /// forwarded.
    pub fn degraded(
        config: GuardConfig,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Arc<Self>> {
        warn!("starting without a detection pipeline, all traffic will be allowed");
        Self::assemble(config, None, metrics_handle)
    }

    fn assemble(
        config: GuardConfig,
        pipeline: Option<DetectionPipeline>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let sensitivity = config
            .sensitivity()
            .unwrap_or(SensitivityLevel::Medium);
        let trusted_proxies = config.trusted_proxy_cidrs();
        let upstream = UpstreamClient::new(&config);
        let telemetry = TelemetrySink::new(DEFAULT_MAX_EVENTS);
        Ok(Arc::new(Self {
            config,
            sensitivity,
            trusted_proxies,
            pipeline,
            upstream,
            telemetry,
            metrics_handle,
            degraded_warned: AtomicBool::new(false),
        }))
    }

    /// Spawn the interval sweepers and the model reload watcher.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        if let Some(pipeline) = self.pipeline.as_ref() {
            Arc::clone(&pipeline.store).start_sweeper(SWEEP_PERIOD);
            Arc::clone(&pipeline.mitigation).start_sweeper(SWEEP_PERIOD);
            Arc::clone(&pipeline.prediction).start_reload_watcher();
        }
    }

    fn warn_degraded_once(&self) {
        if !self.degraded_warned.swap(true, Ordering::Relaxed) {
            warn!("detection pipeline unavailable, allowing all traffic");
        }
    }
}

/// Axum entry point for the catch-all proxy surface.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    handle_request(state, Some(peer.ip()), parts.method, parts.uri, parts.headers, body).await
}

/// Run one request through the full pipeline: bounded body read, client
/// resolution, feature extraction, prediction, verdict, mitigation, and
/// either a deny response or the streamed upstream response. Telemetry and
/// metrics are updated on every terminal decision.
pub async fn handle_request(
    state: Arc<AppState>,
    peer: Option<IpAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let started = Instant::now();
    let trace_id = Uuid::new_v4();
    let method_label = method.to_string();

    let body_limit = if state.config.enable_request_validation {
        state.config.max_request_size_bytes()
    } else {
        usize::MAX
    };
    let body = match body::to_bytes(body, body_limit).await {
        Ok(body) => body,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "request body rejected");
            counter!("ddos_requests_total", 1, "status" => "rejected", "method" => method_label);
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    let Some(client_ip) = resolver::resolve_client_ip(
        peer,
        &headers,
        &state.trusted_proxies,
        state.config.honor_x_forwarded_for,
    ) else {
        warn!(trace_id = %trace_id, "unable to determine client IP");
        counter!("ddos_requests_total", 1, "status" => "rejected", "method" => method_label);
        return error_response(StatusCode::BAD_REQUEST, "Unable to determine client IP");
    };

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let sample = TrafficSample::new(
        client_ip,
        method.as_str(),
        &path_and_query,
        &headers,
        body.len() as u64,
    );

    let Some(pipeline) = state.pipeline.as_ref() else {
        state.warn_degraded_once();
        return forward_upstream(&state, trace_id, started, method, &path_and_query, headers, body)
            .await;
    };

    debug!(trace_id = %trace_id, client_ip = %client_ip, method = %sample.method, path = %sample.path, "analyzing request");

    let features = pipeline.extractor.compute(&sample);
    let prediction = pipeline.prediction.predict(&features, state.sensitivity).await;
    histogram!("ddos_risk_score", prediction.risk_score / 100.0);

    let verdict = pipeline.detector.evaluate(&sample, &features, &prediction);
    let outcome = pipeline.mitigation.apply(client_ip, &verdict);

    if !outcome.allowed {
        let latency = started.elapsed().as_secs_f64();
        state
            .telemetry
            .record(trace_id, &sample, Some(&features), &verdict, &outcome, latency);
        record_denied_metrics(&method_label, &verdict, &outcome, pipeline, latency);
        warn!(
            trace_id = %trace_id,
            client_ip = %client_ip,
            reason = outcome.rule_matched.as_deref().unwrap_or(verdict.reason),
            risk_score = prediction.risk_score,
            "request denied"
        );
        return deny_response(&verdict, &outcome);
    }

    record_allowed_metrics(&prediction);
    let response =
        forward_upstream(&state, trace_id, started, method, &path_and_query, headers, body).await;
    let latency = started.elapsed().as_secs_f64();
    state
        .telemetry
        .record(trace_id, &sample, Some(&features), &verdict, &outcome, latency);
    histogram!("ddos_request_duration_seconds", latency, "status" => "allowed");
    response
}

/// Map a deny decision to its HTTP shape: 429 for rate limiting, 403 for
/// blocks and challenges, with retry hints when known.
fn deny_response(verdict: &Verdict, outcome: &MitigationOutcome) -> Response {
    let (status, detail) = match verdict.action {
        MitigationAction::RateLimit => (StatusCode::TOO_MANY_REQUESTS, "Rate limit applied"),
        MitigationAction::Block => (StatusCode::FORBIDDEN, "Access blocked"),
        MitigationAction::Challenge => (StatusCode::FORBIDDEN, "Challenge required"),
        MitigationAction::Allow => match outcome.rule_matched.as_deref() {
            Some(BASELINE_RULE) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit applied"),
            Some(ACTIVE_BLOCK_RULE) => (StatusCode::FORBIDDEN, "Access blocked"),
            _ => (StatusCode::FORBIDDEN, "Request denied"),
        },
    };

    let mut response = (status, Json(json!({ "detail": detail }))).into_response();
    let headers = response.headers_mut();
    if let Some(retry) = outcome.retry_after_seconds {
        if let Ok(value) = HeaderValue::from_str(&retry.to_string()) {
            headers.insert(HeaderName::from_static("retry-after"), value.clone());
            headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
        }
    }
    if let Some(remaining) = outcome.remaining {
        if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
            headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
        }
    }
    response
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

/// Headers that describe the connection rather than the message; never
/// forwarded back to the client.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

async fn forward_upstream(
    state: &Arc<AppState>,
    trace_id: Uuid,
    started: Instant,
    method: Method,
    path_and_query: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let method_label = method.to_string();
    let body = if body.is_empty() { None } else { Some(body) };
    match state
        .upstream
        .forward(method, path_and_query, &headers, body)
        .await
    {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let mut builder = Response::builder().status(status);
            for (name, value) in upstream_response.headers() {
                if !is_hop_by_hop(name) {
                    builder = builder.header(name, value);
                }
            }
            counter!("ddos_requests_total", 1, "status" => "allowed", "method" => method_label);
            match builder.body(Body::from_stream(upstream_response.bytes_stream())) {
                Ok(response) => response,
                Err(err) => {
                    error!(trace_id = %trace_id, error = %err, "failed to assemble upstream response");
                    error_response(StatusCode::BAD_GATEWAY, "Bad gateway")
                }
            }
        }
        Err(err) => {
            error!(trace_id = %trace_id, error = %err, "upstream forwarding failed");
            counter!("ddos_requests_total", 1, "status" => "error", "method" => method_label);
            histogram!(
                "ddos_request_duration_seconds",
                started.elapsed().as_secs_f64(),
                "status" => "error"
            );
            error_response(StatusCode::BAD_GATEWAY, "Bad gateway")
        }
    }
}

fn record_denied_metrics(
    method_label: &str,
    verdict: &Verdict,
    outcome: &MitigationOutcome,
    pipeline: &DetectionPipeline,
    latency: f64,
) {
    let reason = outcome
        .rule_matched
        .clone()
        .unwrap_or_else(|| verdict.reason.to_string());
    let rate_limited = matches!(verdict.action, MitigationAction::RateLimit)
        || outcome.rule_matched.as_deref() == Some(BASELINE_RULE);
    let status_label = if rate_limited { "rate_limited" } else { "blocked" };

    counter!("ddos_requests_total", 1, "status" => status_label, "method" => method_label.to_string());
    counter!("ddos_requests_blocked_total", 1, "reason" => reason.clone());
    if matches!(verdict.action, MitigationAction::Block) {
        counter!("ddos_blocked_ips_total", 1, "reason" => reason);
    }
    gauge!(
        "ddos_active_blocked_ips",
        (pipeline.mitigation.active_block_count() + pipeline.detector.blocklist_len()) as f64
    );
    histogram!("ddos_request_duration_seconds", latency, "status" => status_label.to_string());
}

fn record_allowed_metrics(prediction: &Prediction) {
    let risk_level = if prediction.risk_score > 70.0 {
        "high"
    } else if prediction.risk_score > 30.0 {
        "medium"
    } else {
        "low"
    };
    counter!("ddos_requests_allowed_total", 1, "risk_level" => risk_level);
}
