use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::info;

use crate::config::{GuardConfig, SensitivityProfile};
use crate::error::Result;
use crate::features::FeatureVector;
use crate::types::{MitigationAction, Prediction, Severity, TrafficSample, Verdict};

/// Hybrid detection engine combining the blocklist, header and volumetric
/// heuristics, and the classifier output into a single verdict.
///
/// The blocklist is read on every request and mutated only through the
/// admin surface, so it is kept behind a copy-on-write swap rather than a
/// lock.
pub struct DetectionEngine {
    blocklist: ArcSwap<HashSet<IpAddr>>,
    whitelist: HashSet<IpAddr>,
    suspicious_user_agents: Vec<String>,
    ip_rate_threshold: f64,
    burst_score_threshold: f64,
    global_rate_threshold: f64,
    ml_confidence_threshold: f64,
    profile: SensitivityProfile,
}

impl DetectionEngine {
    pub fn new(config: &GuardConfig) -> Result<Self> {
        let sensitivity = config.sensitivity().unwrap_or(crate::config::SensitivityLevel::Medium);
        let blocklist: HashSet<IpAddr> = config.blocklist().into_iter().collect();
        let whitelist: HashSet<IpAddr> = config.whitelist().into_iter().collect();
        info!(
            blocklist_count = blocklist.len(),
            whitelist_count = whitelist.len(),
            sensitivity = sensitivity.as_str(),
            ip_rate_threshold = config.ip_rate_threshold,
            burst_score_threshold = config.burst_score_threshold,
            global_rate_threshold = config.global_rate_threshold,
            "detection engine configured"
        );
        Ok(Self {
            blocklist: ArcSwap::from_pointee(blocklist),
            whitelist,
            suspicious_user_agents: config.suspicious_user_agent_patterns(),
            ip_rate_threshold: config.ip_rate_threshold,
            burst_score_threshold: config.burst_score_threshold,
            global_rate_threshold: config.global_rate_threshold,
            ml_confidence_threshold: config.ml_confidence_threshold,
            profile: sensitivity.profile(),
        })
    }

    /// Evaluate one request; the first matching rule wins.
    pub fn evaluate(
        &self,
        sample: &TrafficSample,
        features: &FeatureVector,
        prediction: &Prediction,
    ) -> Verdict {
        if self.blocklist.load().contains(&sample.client_ip) {
            return Verdict {
                action: MitigationAction::Block,
                severity: Severity::Critical,
                reason: "ip_blocklisted",
                detail: Some(format!(
                    "client IP {} present in blocklist",
                    sample.client_ip
                )),
                confidence: None,
            };
        }

        if self.whitelist.contains(&sample.client_ip) {
            return Verdict::allow("ip_whitelisted");
        }

        if let Some(user_agent) = sample.headers.get("user-agent") {
            let user_agent = user_agent.to_lowercase();
            if self
                .suspicious_user_agents
                .iter()
                .any(|pattern| user_agent.contains(pattern))
            {
                return Verdict {
                    action: MitigationAction::Challenge,
                    severity: Severity::High,
                    reason: "suspicious_user_agent",
                    detail: Some(format!("User-Agent: {user_agent}")),
                    confidence: None,
                };
            }
        }

        let burst_threshold = self.burst_score_threshold * self.profile.burst_multiplier;
        if features.ip_request_rate >= self.ip_rate_threshold
            && features.burst_score >= burst_threshold
        {
            return Verdict {
                action: MitigationAction::RateLimit,
                severity: Severity::High,
                reason: "ip_rate_exceeded",
                detail: Some(format!(
                    "rate={:.2}, burst={:.2}",
                    features.ip_request_rate, features.burst_score
                )),
                confidence: None,
            };
        }

        if features.global_request_rate >= self.global_rate_threshold {
            return Verdict {
                action: MitigationAction::RateLimit,
                severity: Severity::Medium,
                reason: "global_rate_spike",
                detail: Some(format!(
                    "global_rate={:.2}",
                    features.global_request_rate
                )),
                confidence: None,
            };
        }

        if !prediction.is_benign && prediction.confidence > self.ml_confidence_threshold {
            let severity = if prediction.risk_score >= 80.0 {
                Severity::High
            } else {
                Severity::Medium
            };
            return Verdict {
                action: MitigationAction::Block,
                severity,
                reason: "ml_detection",
                detail: Some(format!(
                    "confidence={:.2}, risk_score={:.2}",
                    prediction.confidence, prediction.risk_score
                )),
                confidence: Some(prediction.confidence),
            };
        }

        Verdict::allow("baseline")
    }

    pub fn is_blocklisted(&self, ip: IpAddr) -> bool {
        self.blocklist.load().contains(&ip)
    }

    pub fn add_to_blocklist(&self, ip: IpAddr) {
        self.blocklist.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(ip);
            next
        });
        info!(ip = %ip, "IP added to blocklist");
    }

    pub fn remove_from_blocklist(&self, ip: IpAddr) {
        self.blocklist.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(&ip);
            next
        });
        info!(ip = %ip, "IP removed from blocklist");
    }

    pub fn blocklist_ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.blocklist.load().iter().copied().collect();
        ips.sort();
        ips
    }

    pub fn blocklist_len(&self) -> usize {
        self.blocklist.load().len()
    }
}
