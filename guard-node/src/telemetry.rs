use chrono::{DateTime, Utc};
use metrics::{
    describe_counter, describe_gauge, describe_histogram, histogram, increment_counter,
    increment_gauge, Unit,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GuardError, Result};
use crate::features::FeatureVector;
use crate::types::{MitigationAction, MitigationOutcome, Severity, TrafficSample, Verdict};

/// Default capacity of the in-memory event ring.
pub const DEFAULT_MAX_EVENTS: usize = 200;

/// One structured record per terminal decision, kept in a bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub action: MitigationAction,
    pub severity: Severity,
    pub reason: String,
    pub detail: Option<String>,
    pub allowed: bool,
    pub request_rate: f64,
    pub bytes_per_second: f64,
    pub packet_rate: f64,
    pub response_time: f64,
}

/// Bounded in-memory telemetry ring plus the counter/histogram surfaces
/// updated on every terminal decision. Appends copy one event under the
/// mutex and never block the request path beyond that.
pub struct TelemetrySink {
    max_events: usize,
    events: Mutex<VecDeque<TelemetryEvent>>,
}

impl TelemetrySink {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one terminal decision: append to the ring and update the
    /// event counters and histograms in the same call.
    pub fn record(
        &self,
        trace_id: Uuid,
        sample: &TrafficSample,
        features: Option<&FeatureVector>,
        verdict: &Verdict,
        outcome: &MitigationOutcome,
        response_time: f64,
    ) {
        let event = TelemetryEvent {
            trace_id: trace_id.to_string(),
            timestamp: Utc::now(),
            client_ip: sample.client_ip.to_string(),
            action: verdict.action,
            severity: verdict.severity,
            reason: verdict.reason.to_string(),
            detail: verdict.detail.clone(),
            allowed: outcome.allowed,
            request_rate: features.map(|f| f.ip_request_rate).unwrap_or(0.0),
            bytes_per_second: features.map(|f| f.flow_bytes_per_sec).unwrap_or(0.0),
            packet_rate: features.map(|f| f.flow_packets_per_sec).unwrap_or(0.0),
            response_time,
        };

        increment_counter!(
            "ddos_events_total",
            "action" => verdict.action.as_str(),
            "severity" => verdict.severity.as_str(),
            "result" => if outcome.allowed { "allowed" } else { "blocked" }
        );
        if !outcome.allowed {
            increment_gauge!(
                "ddos_active_blocks",
                1.0,
                "severity" => verdict.severity.as_str()
            );
        }
        if let Some(confidence) = verdict.confidence {
            let confidence_level = if confidence > 0.8 {
                "high"
            } else if confidence > 0.5 {
                "medium"
            } else {
                "low"
            };
            increment_counter!(
                "ddos_ml_predictions_total",
                "result" => if outcome.allowed { "benign" } else { "malicious" },
                "confidence_level" => confidence_level
            );
        }
        histogram!("ddos_response_time_seconds", response_time);

        info!(
            trace_id = %event.trace_id,
            client_ip = %event.client_ip,
            action = verdict.action.as_str(),
            severity = verdict.severity.as_str(),
            reason = %event.reason,
            allowed = outcome.allowed,
            response_time = response_time,
            "ddos detection event"
        );

        match self.events.lock() {
            Ok(mut events) => {
                events.push_front(event);
                while events.len() > self.max_events {
                    events.pop_back();
                }
            }
            Err(poisoned) => {
                warn!("telemetry ring mutex was poisoned, recovering");
                let mut events = poisoned.into_inner();
                events.push_front(event);
                while events.len() > self.max_events {
                    events.pop_back();
                }
            }
        }
    }

    /// Recent events, newest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<TelemetryEvent> {
        let events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        let take = limit.unwrap_or(events.len());
        events.iter().take(take).cloned().collect()
    }
}

/// Install the Prometheus recorder with the facade's histogram buckets and
/// register metric descriptions. Call once at startup.
pub fn install_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("ddos_request_duration_seconds".to_string()),
            &[0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0],
        )
        .map_err(|e| GuardError::Config(format!("metrics recorder: {e}")))?
        .set_buckets_for_metric(
            Matcher::Full("ddos_risk_score".to_string()),
            &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9],
        )
        .map_err(|e| GuardError::Config(format!("metrics recorder: {e}")))?
        .set_buckets_for_metric(
            Matcher::Full("ddos_model_inference_seconds".to_string()),
            &[0.001, 0.01, 0.05, 0.1, 0.5, 1.0],
        )
        .map_err(|e| GuardError::Config(format!("metrics recorder: {e}")))?
        .set_buckets_for_metric(
            Matcher::Full("ddos_response_time_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5],
        )
        .map_err(|e| GuardError::Config(format!("metrics recorder: {e}")))?
        .install_recorder()
        .map_err(|e| GuardError::Config(format!("metrics recorder: {e}")))?;
    describe_metrics();
    Ok(handle)
}

/// Register names, units and help text for the metrics surface.
pub fn describe_metrics() {
    describe_counter!(
        "ddos_requests_total",
        "Total number of requests processed, by status and method"
    );
    describe_counter!(
        "ddos_requests_blocked_total",
        "Total number of requests blocked, by reason"
    );
    describe_counter!(
        "ddos_requests_allowed_total",
        "Total number of requests allowed, by risk level"
    );
    describe_counter!(
        "ddos_blocked_ips_total",
        "Total number of IPs blocked, by reason"
    );
    describe_counter!(
        "ddos_events_total",
        "Detection events, by action, severity and result"
    );
    describe_counter!(
        "ddos_ml_predictions_total",
        "Classifier predictions, by result and confidence bucket"
    );
    describe_counter!(
        "ddos_prediction_errors_total",
        "Model evaluations that failed and degraded to neutral"
    );
    describe_counter!(
        "ddos_prediction_cache_hits_total",
        "Prediction cache hits"
    );
    describe_counter!(
        "ddos_prediction_queue_overflows_total",
        "Prediction requests evaluated directly because the batch queue was full"
    );
    describe_gauge!(
        "ddos_active_blocked_ips",
        "Number of currently blocked IPs"
    );
    describe_gauge!(
        "ddos_active_blocks",
        "Active blocks, by severity"
    );
    describe_gauge!(
        "ddos_mitigation_tracked_ips",
        "IPs currently tracked by the mitigation controller"
    );
    describe_histogram!(
        "ddos_request_duration_seconds",
        Unit::Seconds,
        "Request processing duration, by status"
    );
    describe_histogram!(
        "ddos_risk_score",
        "Distribution of risk scores for analyzed requests"
    );
    describe_histogram!(
        "ddos_model_inference_seconds",
        Unit::Seconds,
        "Model inference duration"
    );
    describe_histogram!(
        "ddos_response_time_seconds",
        Unit::Seconds,
        "Detection and mitigation latency"
    );
}
