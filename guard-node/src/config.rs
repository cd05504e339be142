use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::info;

use crate::error::{GuardError, Result};

/// Detection sensitivity selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityLevel {
    /// More permissive, fewer false positives
    Low,
    /// Balanced
    Medium,
    /// More strict, fewer false negatives
    High,
}

impl SensitivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityLevel::Low => "low",
            SensitivityLevel::Medium => "medium",
            SensitivityLevel::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(SensitivityLevel::Low),
            "medium" => Some(SensitivityLevel::Medium),
            "high" => Some(SensitivityLevel::High),
            _ => None,
        }
    }

    /// Threshold triple governing how classifier output converts into
    /// hostile verdicts.
    pub fn profile(&self) -> SensitivityProfile {
        match self {
            SensitivityLevel::Low => SensitivityProfile {
                confidence_threshold: 0.85,
                risk_score_threshold: 85.0,
                burst_multiplier: 1.5,
            },
            SensitivityLevel::Medium => SensitivityProfile {
                confidence_threshold: 0.75,
                risk_score_threshold: 75.0,
                burst_multiplier: 1.0,
            },
            SensitivityLevel::High => SensitivityProfile {
                confidence_threshold: 0.65,
                risk_score_threshold: 65.0,
                burst_multiplier: 0.75,
            },
        }
    }
}

/// Per-sensitivity threshold set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitivityProfile {
    pub confidence_threshold: f64,
    pub risk_score_threshold: f64,
    pub burst_multiplier: f64,
}

fn default_sensitivity() -> String {
    "medium".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_base_rate_limit() -> u32 {
    120
}

fn default_rate_window_seconds() -> i64 {
    60
}

fn default_burst_multiplier() -> f64 {
    1.5
}

fn default_request_rate_limit() -> u32 {
    5
}

fn default_sliding_window_seconds() -> i64 {
    60
}

fn default_block_duration_minutes() -> u64 {
    30
}

fn default_block_threshold_violations() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_block_duration_hours() -> u64 {
    24
}

fn default_model_path() -> String {
    "models".to_string()
}

fn default_model_update_interval_hours() -> u64 {
    24
}

fn default_model_cache_ttl_seconds() -> u64 {
    300
}

fn default_model_cache_max_size() -> usize {
    10_000
}

fn default_batch_prediction_size() -> usize {
    100
}

fn default_feature_window_seconds() -> i64 {
    300
}

fn default_min_samples_required() -> usize {
    10
}

fn default_max_request_size_kb() -> usize {
    1024
}

fn default_ip_rate_threshold() -> f64 {
    5.0
}

fn default_burst_score_threshold() -> f64 {
    6.0
}

fn default_global_rate_threshold() -> f64 {
    400.0
}

fn default_ml_confidence_threshold() -> f64 {
    0.8
}

fn default_suspicious_user_agents() -> String {
    "masscan,sqlmap,wget".to_string()
}

fn default_upstream_timeout_seconds() -> f64 {
    10.0
}

fn default_upstream_connect_timeout_seconds() -> f64 {
    20.0
}

fn default_upstream_max_retries() -> u32 {
    3
}

fn default_upstream_retry_backoff_seconds() -> f64 {
    0.1
}

fn default_upstream_max_connections() -> usize {
    100
}

/// Runtime configuration for the guard node, populated from `GUARD_*`
/// environment variables. Boolean values accept true/false/1/0/yes/no/on/off
/// in any case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Target origin for forwarding; scheme is required
    pub upstream_base_url: String,
    /// Opaque token required by admin endpoints; admin surface is closed
    /// when unset
    #[serde(default)]
    pub admin_api_key: Option<String>,
    /// Detection sensitivity: low, medium or high
    #[serde(default = "default_sensitivity")]
    pub sensitivity_level: String,
    /// Proxy listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    // Baseline throughput
    #[serde(default = "default_base_rate_limit")]
    pub base_rate_limit: u32,
    #[serde(default = "default_rate_window_seconds")]
    pub rate_window_seconds: i64,
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,

    // Per-IP limiter
    #[serde(default = "default_request_rate_limit")]
    pub request_rate_limit: u32,
    #[serde(default = "default_sliding_window_seconds")]
    pub sliding_window_seconds: i64,

    // Blocking policy
    #[serde(default = "default_block_duration_minutes")]
    pub block_duration_minutes: u64,
    #[serde(default = "default_block_threshold_violations")]
    pub block_threshold_violations: u32,
    #[serde(default = "default_true")]
    pub progressive_blocking: bool,
    #[serde(default = "default_max_block_duration_hours")]
    pub max_block_duration_hours: u64,

    // Classifier and cache tuning
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_model_update_interval_hours")]
    pub model_update_interval_hours: u64,
    #[serde(default = "default_true")]
    pub enable_model_cache: bool,
    #[serde(default = "default_model_cache_ttl_seconds")]
    pub model_cache_ttl_seconds: u64,
    #[serde(default = "default_model_cache_max_size")]
    pub model_cache_max_size: usize,
    #[serde(default = "default_batch_prediction_size")]
    pub batch_prediction_size: usize,

    // Feature extraction
    #[serde(default = "default_feature_window_seconds")]
    pub feature_window_seconds: i64,
    #[serde(default = "default_min_samples_required")]
    pub min_samples_required: usize,

    // IP management, comma-separated lists
    #[serde(default)]
    pub blocklist_ips: String,
    #[serde(default)]
    pub whitelist_ips: String,
    #[serde(default)]
    pub trusted_proxies: String,
    #[serde(default)]
    pub country_blocklist: String,
    #[serde(default)]
    pub asn_blocklist: String,

    // Request handling policy
    #[serde(default)]
    pub honor_x_forwarded_for: bool,
    #[serde(default = "default_max_request_size_kb")]
    pub max_request_size_kb: usize,
    #[serde(default = "default_true")]
    pub enable_request_validation: bool,

    // Detection thresholds
    #[serde(default = "default_ip_rate_threshold")]
    pub ip_rate_threshold: f64,
    #[serde(default = "default_burst_score_threshold")]
    pub burst_score_threshold: f64,
    #[serde(default = "default_global_rate_threshold")]
    pub global_rate_threshold: f64,
    #[serde(default = "default_ml_confidence_threshold")]
    pub ml_confidence_threshold: f64,
    #[serde(default = "default_suspicious_user_agents")]
    pub suspicious_user_agents: String,

    // Upstream client tuning
    #[serde(default = "default_upstream_timeout_seconds")]
    pub upstream_timeout_seconds: f64,
    #[serde(default = "default_upstream_connect_timeout_seconds")]
    pub upstream_connect_timeout_seconds: f64,
    #[serde(default = "default_upstream_max_retries")]
    pub upstream_max_retries: u32,
    #[serde(default = "default_upstream_retry_backoff_seconds")]
    pub upstream_retry_backoff_seconds: f64,
    #[serde(default = "default_upstream_max_connections")]
    pub upstream_max_connections: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: "http://127.0.0.1:8080".to_string(),
            admin_api_key: None,
            sensitivity_level: default_sensitivity(),
            listen_addr: default_listen_addr(),
            base_rate_limit: default_base_rate_limit(),
            rate_window_seconds: default_rate_window_seconds(),
            burst_multiplier: default_burst_multiplier(),
            request_rate_limit: default_request_rate_limit(),
            sliding_window_seconds: default_sliding_window_seconds(),
            block_duration_minutes: default_block_duration_minutes(),
            block_threshold_violations: default_block_threshold_violations(),
            progressive_blocking: true,
            max_block_duration_hours: default_max_block_duration_hours(),
            model_path: default_model_path(),
            model_update_interval_hours: default_model_update_interval_hours(),
            enable_model_cache: true,
            model_cache_ttl_seconds: default_model_cache_ttl_seconds(),
            model_cache_max_size: default_model_cache_max_size(),
            batch_prediction_size: default_batch_prediction_size(),
            feature_window_seconds: default_feature_window_seconds(),
            min_samples_required: default_min_samples_required(),
            blocklist_ips: String::new(),
            whitelist_ips: String::new(),
            trusted_proxies: String::new(),
            country_blocklist: String::new(),
            asn_blocklist: String::new(),
            honor_x_forwarded_for: false,
            max_request_size_kb: default_max_request_size_kb(),
            enable_request_validation: true,
            ip_rate_threshold: default_ip_rate_threshold(),
            burst_score_threshold: default_burst_score_threshold(),
            global_rate_threshold: default_global_rate_threshold(),
            ml_confidence_threshold: default_ml_confidence_threshold(),
            suspicious_user_agents: default_suspicious_user_agents(),
            upstream_timeout_seconds: default_upstream_timeout_seconds(),
            upstream_connect_timeout_seconds: default_upstream_connect_timeout_seconds(),
            upstream_max_retries: default_upstream_max_retries(),
            upstream_retry_backoff_seconds: default_upstream_retry_backoff_seconds(),
            upstream_max_connections: default_upstream_max_connections(),
        }
    }
}

/// Split a comma-separated list, dropping empty items.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a CIDR entry, treating a bare address as a host network.
pub fn parse_cidr(value: &str) -> Option<IpNet> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Some(net);
    }
    value.parse::<IpAddr>().ok().map(IpNet::from)
}

impl GuardConfig {
    /// Load configuration from `GUARD_*` environment variables, reconcile
    /// interdependent settings and validate eagerly.
    pub fn from_env() -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("GUARD"))
            .build()
            .map_err(|e| GuardError::Config(e.to_string()))?;

        let mut settings: GuardConfig = source
            .try_deserialize()
            .map_err(|e| GuardError::Config(e.to_string()))?;
        settings.reconcile();
        settings.validate()?;
        Ok(settings)
    }

    /// Adjust interdependent settings: the block duration is capped by the
    /// configured maximum and the feature window never undercuts the rate
    /// window.
    pub fn reconcile(&mut self) {
        let max_block_minutes = self.max_block_duration_hours.saturating_mul(60);
        if self.block_duration_minutes > max_block_minutes {
            info!(
                block_duration_minutes = self.block_duration_minutes,
                max_block_minutes, "block duration capped to configured maximum"
            );
            self.block_duration_minutes = max_block_minutes;
        }
        if self.feature_window_seconds < self.rate_window_seconds {
            self.feature_window_seconds = self.rate_window_seconds;
        }
    }

    /// Validate configuration; any failure here aborts startup.
    pub fn validate(&self) -> Result<()> {
        if !self.upstream_base_url.starts_with("http://")
            && !self.upstream_base_url.starts_with("https://")
        {
            return Err(GuardError::Config(
                "upstream_base_url must start with http:// or https://".to_string(),
            ));
        }
        if reqwest::Url::parse(&self.upstream_base_url).is_err() {
            return Err(GuardError::Config(format!(
                "upstream_base_url is not a valid URL: {}",
                self.upstream_base_url
            )));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(GuardError::Config(format!(
                "listen_addr is not a valid socket address: {}",
                self.listen_addr
            )));
        }
        if self.sensitivity().is_none() {
            return Err(GuardError::Config(format!(
                "sensitivity_level must be low, medium or high, got: {}",
                self.sensitivity_level
            )));
        }
        if self.sliding_window_seconds <= 0 {
            return Err(GuardError::Config(
                "sliding_window_seconds must be positive".to_string(),
            ));
        }
        if self.rate_window_seconds <= 0 {
            return Err(GuardError::Config(
                "rate_window_seconds must be positive".to_string(),
            ));
        }
        if self.feature_window_seconds <= 0 {
            return Err(GuardError::Config(
                "feature_window_seconds must be positive".to_string(),
            ));
        }
        if self.request_rate_limit == 0 {
            return Err(GuardError::Config(
                "request_rate_limit must be at least 1".to_string(),
            ));
        }
        if self.max_request_size_kb == 0 {
            return Err(GuardError::Config(
                "max_request_size_kb must be at least 1".to_string(),
            ));
        }
        for entry in parse_list(&self.trusted_proxies) {
            if parse_cidr(&entry).is_none() {
                return Err(GuardError::Config(format!(
                    "trusted_proxies contains an invalid CIDR: {entry}"
                )));
            }
        }
        for entry in parse_list(&self.blocklist_ips) {
            if entry.parse::<IpAddr>().is_err() {
                return Err(GuardError::Config(format!(
                    "blocklist_ips contains an invalid IP: {entry}"
                )));
            }
        }
        for entry in parse_list(&self.whitelist_ips) {
            if entry.parse::<IpAddr>().is_err() {
                return Err(GuardError::Config(format!(
                    "whitelist_ips contains an invalid IP: {entry}"
                )));
            }
        }
        Ok(())
    }

    pub fn sensitivity(&self) -> Option<SensitivityLevel> {
        SensitivityLevel::parse(&self.sensitivity_level)
    }

    /// Trusted proxy CIDRs; call after `validate()`.
    pub fn trusted_proxy_cidrs(&self) -> Vec<IpNet> {
        parse_list(&self.trusted_proxies)
            .iter()
            .filter_map(|entry| parse_cidr(entry))
            .collect()
    }

    pub fn blocklist(&self) -> Vec<IpAddr> {
        parse_list(&self.blocklist_ips)
            .iter()
            .filter_map(|entry| entry.parse().ok())
            .collect()
    }

    pub fn whitelist(&self) -> Vec<IpAddr> {
        parse_list(&self.whitelist_ips)
            .iter()
            .filter_map(|entry| entry.parse().ok())
            .collect()
    }

    pub fn suspicious_user_agent_patterns(&self) -> Vec<String> {
        parse_list(&self.suspicious_user_agents)
            .iter()
            .map(|p| p.to_lowercase())
            .collect()
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_minutes * 60)
    }

    pub fn max_block_duration(&self) -> Duration {
        Duration::from_secs(self.max_block_duration_hours * 3600)
    }

    pub fn sliding_window(&self) -> Duration {
        Duration::from_secs(self.sliding_window_seconds.max(0) as u64)
    }

    pub fn model_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.model_cache_ttl_seconds)
    }

    pub fn model_update_interval(&self) -> Duration {
        Duration::from_secs(self.model_update_interval_hours * 3600)
    }

    pub fn max_request_size_bytes(&self) -> usize {
        self.max_request_size_kb.saturating_mul(1024)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.upstream_timeout_seconds.max(0.001))
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.upstream_connect_timeout_seconds.max(0.001))
    }

    pub fn upstream_retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.upstream_retry_backoff_seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sensitivity(), Some(SensitivityLevel::Medium));
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let config = GuardConfig {
            upstream_base_url: "ftp://origin".to_string(),
            ..GuardConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("upstream_base_url"));
    }

    #[test]
    fn test_rejects_nonpositive_window() {
        let config = GuardConfig {
            sliding_window_seconds: 0,
            ..GuardConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sliding_window_seconds"));

        let config = GuardConfig {
            sliding_window_seconds: -5,
            ..GuardConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_sensitivity() {
        let config = GuardConfig {
            sensitivity_level: "paranoid".to_string(),
            ..GuardConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sensitivity_level"));
    }

    #[test]
    fn test_rejects_invalid_cidr_naming_key() {
        let config = GuardConfig {
            trusted_proxies: "10.0.0.0/8,not-a-cidr".to_string(),
            ..GuardConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("trusted_proxies"));
        assert!(err.to_string().contains("not-a-cidr"));
    }

    #[test]
    fn test_bare_ip_accepted_as_trusted_proxy() {
        let config = GuardConfig {
            trusted_proxies: "10.0.0.1".to_string(),
            ..GuardConfig::default()
        };
        assert!(config.validate().is_ok());
        let cidrs = config.trusted_proxy_cidrs();
        assert_eq!(cidrs.len(), 1);
        assert!(cidrs[0].contains(&"10.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_reconcile_caps_block_duration() {
        let mut config = GuardConfig {
            block_duration_minutes: 10_000,
            max_block_duration_hours: 1,
            ..GuardConfig::default()
        };
        config.reconcile();
        assert_eq!(config.block_duration_minutes, 60);
    }

    #[test]
    fn test_reconcile_raises_feature_window() {
        let mut config = GuardConfig {
            feature_window_seconds: 30,
            rate_window_seconds: 60,
            ..GuardConfig::default()
        };
        config.reconcile();
        assert_eq!(config.feature_window_seconds, 60);
    }

    #[test]
    fn test_parse_list_skips_empty_items() {
        assert_eq!(parse_list(""), Vec::<String>::new());
        assert_eq!(parse_list("a, ,b,"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_sensitivity_profiles() {
        let low = SensitivityLevel::Low.profile();
        assert_eq!(low.confidence_threshold, 0.85);
        assert_eq!(low.risk_score_threshold, 85.0);
        let high = SensitivityLevel::High.profile();
        assert_eq!(high.burst_multiplier, 0.75);
    }

    #[test]
    fn test_from_env_reads_prefixed_keys() {
        std::env::set_var("GUARD_UPSTREAM_BASE_URL", "http://origin:9000");
        std::env::set_var("GUARD_REQUEST_RATE_LIMIT", "7");
        std::env::set_var("GUARD_HONOR_X_FORWARDED_FOR", "yes");
        let config = GuardConfig::from_env().unwrap();
        assert_eq!(config.upstream_base_url, "http://origin:9000");
        assert_eq!(config.request_rate_limit, 7);
        assert!(config.honor_x_forwarded_for);
        std::env::remove_var("GUARD_UPSTREAM_BASE_URL");
        std::env::remove_var("GUARD_REQUEST_RATE_LIMIT");
        std::env::remove_var("GUARD_HONOR_X_FORWARDED_FOR");
    }
}
