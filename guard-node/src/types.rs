use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::window::unix_now;

/// Immutable record of a single inbound request, built once by the handler
/// and consumed read-only by the rest of the pipeline.
#[derive(Debug, Clone)]
pub struct TrafficSample {
    /// Normalized client IP address
    pub client_ip: IpAddr,
    /// HTTP method
    pub method: String,
    /// Request path including the query string
    pub path: String,
    /// Request headers, keys folded to lowercase
    pub headers: HashMap<String, String>,
    /// Request body size in bytes
    pub content_length: u64,
    /// Arrival time, seconds since the Unix epoch
    pub timestamp: f64,
}

impl TrafficSample {
    pub fn new(
        client_ip: IpAddr,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        content_length: u64,
    ) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        Self {
            client_ip,
            method: method.to_string(),
            path: path.to_string(),
            headers,
            content_length,
            timestamp: unix_now(),
        }
    }
}

/// Edge action selected by the detection engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    Allow,
    Block,
    RateLimit,
    Challenge,
}

impl MitigationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MitigationAction::Allow => "allow",
            MitigationAction::Block => "block",
            MitigationAction::RateLimit => "rate_limit",
            MitigationAction::Challenge => "challenge",
        }
    }
}

/// Verdict severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Decision produced by the detection engine for one request
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub action: MitigationAction,
    pub severity: Severity,
    /// Stable machine-readable tag for the matched rule
    pub reason: &'static str,
    /// Human-readable context for the matched rule
    pub detail: Option<String>,
    /// Classifier confidence, present only for model-driven verdicts
    pub confidence: Option<f64>,
}

impl Verdict {
    pub fn allow(reason: &'static str) -> Self {
        Self {
            action: MitigationAction::Allow,
            severity: Severity::Low,
            reason,
            detail: None,
            confidence: None,
        }
    }
}

/// Enforceable effect produced by the mitigation controller
#[derive(Debug, Clone, Serialize)]
pub struct MitigationOutcome {
    pub allowed: bool,
    pub rule_matched: Option<String>,
    pub retry_after_seconds: Option<u64>,
    pub remaining: Option<u32>,
}

impl MitigationOutcome {
    pub fn allowed(remaining: Option<u32>) -> Self {
        Self {
            allowed: true,
            rule_matched: None,
            retry_after_seconds: None,
            remaining,
        }
    }

    pub fn denied(rule: &str, retry_after_seconds: Option<u64>, remaining: Option<u32>) -> Self {
        Self {
            allowed: false,
            rule_matched: Some(rule.to_string()),
            retry_after_seconds,
            remaining,
        }
    }
}

/// Classifier output for one feature vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub is_benign: bool,
    /// Attack likelihood scaled to [0, 100]
    pub risk_score: f64,
    /// Model confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub feature_contributions: HashMap<String, f64>,
}

impl Prediction {
    /// Neutral output used whenever the model is unavailable or failing;
    /// the pipeline degrades to heuristics-only evaluation.
    pub fn neutral() -> Self {
        Self {
            is_benign: true,
            risk_score: 0.0,
            confidence: 1.0,
            feature_contributions: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_sample_lowercases_header_names() {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_static("curl/8.0"));
        headers.insert("X-Custom", HeaderValue::from_static("v"));
        let sample = TrafficSample::new("1.2.3.4".parse().unwrap(), "GET", "/x", &headers, 0);
        assert_eq!(sample.headers.get("user-agent").map(String::as_str), Some("curl/8.0"));
        assert_eq!(sample.headers.get("x-custom").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_action_labels() {
        assert_eq!(MitigationAction::RateLimit.as_str(), "rate_limit");
        assert_eq!(MitigationAction::Block.as_str(), "block");
    }

    #[test]
    fn test_neutral_prediction_is_benign() {
        let p = Prediction::neutral();
        assert!(p.is_benign);
        assert_eq!(p.risk_score, 0.0);
        assert_eq!(p.confidence, 1.0);
    }
}
