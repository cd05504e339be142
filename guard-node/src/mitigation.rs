use dashmap::DashMap;
use metrics::gauge;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::config::GuardConfig;
use crate::types::{MitigationAction, MitigationOutcome, Verdict};

/// Outcome rule tag for the always-on per-IP limiter.
pub const BASELINE_RULE: &str = "request_rate_limit";
/// Outcome rule tag for requests arriving while a block is still active.
pub const ACTIVE_BLOCK_RULE: &str = "active_block";

#[derive(Debug)]
struct IpState {
    /// Instants of recently allowed requests, oldest first
    allowed_stamps: VecDeque<Instant>,
    /// Window stamp for the strict first-in-window rule
    last_allowed: Option<Instant>,
    block_until: Option<Instant>,
    violations: u32,
    last_violation: Option<Instant>,
}

impl IpState {
    fn new() -> Self {
        Self {
            allowed_stamps: VecDeque::new(),
            last_allowed: None,
            block_until: None,
            violations: 0,
            last_violation: None,
        }
    }
}

/// Enforces per-IP rate limiting and short-lived blocks.
///
/// Per-IP state lives in a sharded map; each entry is mutated under its
/// shard lock, and the handler awaits each request to completion, so
/// same-IP decisions keep arrival order.
pub struct MitigationController {
    request_rate_limit: usize,
    window: Duration,
    block_duration: Duration,
    max_block_duration: Duration,
    progressive_blocking: bool,
    violation_threshold: u32,
    states: DashMap<IpAddr, IpState>,
}

impl MitigationController {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            request_rate_limit: config.request_rate_limit.max(1) as usize,
            window: config.sliding_window(),
            block_duration: config.block_duration(),
            max_block_duration: config.max_block_duration(),
            progressive_blocking: config.progressive_blocking,
            violation_threshold: config.block_threshold_violations,
            states: DashMap::new(),
        }
    }

    /// Apply the verdict for one request and produce the enforceable effect.
    pub fn apply(&self, ip: IpAddr, verdict: &Verdict) -> MitigationOutcome {
        let now = Instant::now();
        let mut entry = self.states.entry(ip).or_insert_with(IpState::new);
        let state = entry.value_mut();

        // An unexpired block denies regardless of the current verdict.
        if let Some(until) = state.block_until {
            if until > now {
                let retry = until.duration_since(now).as_secs().max(1);
                return MitigationOutcome::denied(ACTIVE_BLOCK_RULE, Some(retry), Some(0));
            }
            state.block_until = None;
        }

        match verdict.action {
            MitigationAction::Allow => self.check_baseline(state, now),
            MitigationAction::RateLimit => self.apply_rate_limit(state, now, verdict),
            MitigationAction::Block => self.apply_block(state, now, verdict),
            MitigationAction::Challenge => {
                MitigationOutcome::denied(verdict.reason, None, None)
            }
        }
    }

    /// Baseline limiter: at most `request_rate_limit` allowed requests per
    /// sliding window, independent of any detection verdict.
    fn check_baseline(&self, state: &mut IpState, now: Instant) -> MitigationOutcome {
        while state
            .allowed_stamps
            .front()
            .map_or(false, |stamp| now.duration_since(*stamp) >= self.window)
        {
            state.allowed_stamps.pop_front();
        }

        if state.allowed_stamps.len() < self.request_rate_limit {
            state.allowed_stamps.push_back(now);
            state.last_allowed = Some(now);
            let remaining = (self.request_rate_limit - state.allowed_stamps.len()) as u32;
            return MitigationOutcome::allowed(Some(remaining));
        }

        let retry = state
            .allowed_stamps
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(self.window);
        MitigationOutcome::denied(BASELINE_RULE, Some(retry.as_secs().max(1)), Some(0))
    }

    /// Strict limiter for RATE_LIMIT verdicts: only the first request of a
    /// window passes.
    fn apply_rate_limit(
        &self,
        state: &mut IpState,
        now: Instant,
        verdict: &Verdict,
    ) -> MitigationOutcome {
        let window_open = state
            .last_allowed
            .map_or(true, |last| now.duration_since(last) >= self.window);
        if window_open {
            state.last_allowed = Some(now);
            state.allowed_stamps.push_back(now);
            let remaining = self
                .request_rate_limit
                .saturating_sub(state.allowed_stamps.len()) as u32;
            return MitigationOutcome::allowed(Some(remaining));
        }
        let retry = state
            .last_allowed
            .map(|last| self.window.saturating_sub(now.duration_since(last)))
            .unwrap_or(self.window);
        MitigationOutcome::denied(verdict.reason, Some(retry.as_secs().max(1)), Some(0))
    }

    fn apply_block(
        &self,
        state: &mut IpState,
        now: Instant,
        verdict: &Verdict,
    ) -> MitigationOutcome {
        state.violations = state.violations.saturating_add(1);
        state.last_violation = Some(now);

        let mut duration_secs = self.block_duration.as_secs();
        if self.progressive_blocking && state.violations > self.violation_threshold {
            let excess = (state.violations - self.violation_threshold).min(16);
            duration_secs = duration_secs.saturating_mul(1u64 << excess);
        }
        duration_secs = duration_secs.min(self.max_block_duration.as_secs());
        let duration = Duration::from_secs(duration_secs);

        state.block_until = Some(now + duration);
        warn!(
            violations = state.violations,
            block_seconds = duration_secs,
            reason = verdict.reason,
            "IP blocked"
        );
        MitigationOutcome::denied(verdict.reason, Some(duration_secs), Some(0))
    }

    /// Number of IPs currently under an active block.
    pub fn active_block_count(&self) -> usize {
        let now = Instant::now();
        self.states
            .iter()
            .filter(|entry| entry.value().block_until.map_or(false, |until| until > now))
            .count()
    }

    /// Evict state for IPs whose block expired and whose limiter stamps all
    /// left the window; violation history decays after the maximum block
    /// horizon.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.states.retain(|_, state| {
            if let Some(last) = state.last_violation {
                if now.duration_since(last) > self.max_block_duration {
                    state.violations = 0;
                    state.last_violation = None;
                }
            }
            let block_active = state.block_until.map_or(false, |until| until > now);
            let stamps_recent = state
                .allowed_stamps
                .back()
                .map_or(false, |stamp| now.duration_since(*stamp) < self.window);
            block_active || stamps_recent || state.violations > 0
        });
        gauge!("ddos_mitigation_tracked_ips", self.states.len() as f64);
        debug!(tracked_ips = self.states.len(), "mitigation sweep completed");
    }

    /// Start the periodic eviction task.
    pub fn start_sweeper(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        });
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn verdict(action: MitigationAction, reason: &'static str) -> Verdict {
        Verdict {
            action,
            severity: Severity::High,
            reason,
            detail: None,
            confidence: None,
        }
    }

    fn controller(config: GuardConfig) -> MitigationController {
        MitigationController::new(&config)
    }

    #[test]
    fn test_allow_passes_within_baseline_budget() {
        let controller = controller(GuardConfig {
            request_rate_limit: 3,
            ..GuardConfig::default()
        });
        let allow = verdict(MitigationAction::Allow, "baseline");
        for expected_remaining in [2u32, 1, 0] {
            let outcome = controller.apply(ip("9.9.9.9"), &allow);
            assert!(outcome.allowed);
            assert_eq!(outcome.remaining, Some(expected_remaining));
        }
        let denied = controller.apply(ip("9.9.9.9"), &allow);
        assert!(!denied.allowed);
        assert_eq!(denied.rule_matched.as_deref(), Some(BASELINE_RULE));
        let retry = denied.retry_after_seconds.unwrap();
        assert!(retry >= 58 && retry <= 60, "retry_after was {retry}");
    }

    #[test]
    fn test_baseline_budget_is_per_ip() {
        let controller = controller(GuardConfig {
            request_rate_limit: 1,
            ..GuardConfig::default()
        });
        let allow = verdict(MitigationAction::Allow, "baseline");
        assert!(controller.apply(ip("1.1.1.1"), &allow).allowed);
        assert!(controller.apply(ip("2.2.2.2"), &allow).allowed);
        assert!(!controller.apply(ip("1.1.1.1"), &allow).allowed);
    }

    #[test]
    fn test_rate_limit_verdict_first_in_window_only() {
        let controller = controller(GuardConfig::default());
        let limited = verdict(MitigationAction::RateLimit, "ip_rate_exceeded");
        let first = controller.apply(ip("7.7.7.7"), &limited);
        assert!(first.allowed);
        let second = controller.apply(ip("7.7.7.7"), &limited);
        assert!(!second.allowed);
        assert_eq!(second.rule_matched.as_deref(), Some("ip_rate_exceeded"));
        assert!(second.retry_after_seconds.unwrap() <= 60);
    }

    #[test]
    fn test_block_sets_retry_after_to_duration() {
        let controller = controller(GuardConfig {
            block_duration_minutes: 30,
            ..GuardConfig::default()
        });
        let blocked = verdict(MitigationAction::Block, "ml_detection");
        let outcome = controller.apply(ip("6.6.6.6"), &blocked);
        assert!(!outcome.allowed);
        assert_eq!(outcome.rule_matched.as_deref(), Some("ml_detection"));
        assert_eq!(outcome.retry_after_seconds, Some(30 * 60));
    }

    #[test]
    fn test_active_block_denies_subsequent_allow() {
        let controller = controller(GuardConfig::default());
        controller.apply(ip("6.6.6.6"), &verdict(MitigationAction::Block, "ml_detection"));
        let outcome =
            controller.apply(ip("6.6.6.6"), &verdict(MitigationAction::Allow, "baseline"));
        assert!(!outcome.allowed);
        assert_eq!(outcome.rule_matched.as_deref(), Some(ACTIVE_BLOCK_RULE));
        assert!(outcome.retry_after_seconds.unwrap() > 0);
    }

    #[test]
    fn test_progressive_blocking_escalates_and_caps() {
        let controller = controller(GuardConfig {
            block_duration_minutes: 30,
            block_threshold_violations: 1,
            progressive_blocking: true,
            max_block_duration_hours: 2,
            ..GuardConfig::default()
        });
        let blocked = verdict(MitigationAction::Block, "ml_detection");

        let first = controller.apply(ip("6.6.6.6"), &blocked);
        assert_eq!(first.retry_after_seconds, Some(30 * 60));

        // Clear the active block so the next verdict reaches the block path.
        if let Some(mut state) = controller.states.get_mut(&ip("6.6.6.6")) {
            state.block_until = None;
        }
        let second = controller.apply(ip("6.6.6.6"), &blocked);
        assert_eq!(second.retry_after_seconds, Some(60 * 60));

        if let Some(mut state) = controller.states.get_mut(&ip("6.6.6.6")) {
            state.block_until = None;
        }
        let third = controller.apply(ip("6.6.6.6"), &blocked);
        // 30min * 2^2 = 2h hits the cap exactly; further doubling stays there.
        assert_eq!(third.retry_after_seconds, Some(2 * 3600));

        if let Some(mut state) = controller.states.get_mut(&ip("6.6.6.6")) {
            state.block_until = None;
        }
        let fourth = controller.apply(ip("6.6.6.6"), &blocked);
        assert_eq!(fourth.retry_after_seconds, Some(2 * 3600));
    }

    #[test]
    fn test_progressive_blocking_disabled_keeps_base_duration() {
        let controller = controller(GuardConfig {
            block_duration_minutes: 30,
            block_threshold_violations: 1,
            progressive_blocking: false,
            ..GuardConfig::default()
        });
        let blocked = verdict(MitigationAction::Block, "ml_detection");
        controller.apply(ip("6.6.6.6"), &blocked);
        if let Some(mut state) = controller.states.get_mut(&ip("6.6.6.6")) {
            state.block_until = None;
        }
        let repeat = controller.apply(ip("6.6.6.6"), &blocked);
        assert_eq!(repeat.retry_after_seconds, Some(30 * 60));
    }

    #[test]
    fn test_challenge_denies_with_reason() {
        let controller = controller(GuardConfig::default());
        let outcome = controller.apply(
            ip("5.5.5.5"),
            &verdict(MitigationAction::Challenge, "suspicious_user_agent"),
        );
        assert!(!outcome.allowed);
        assert_eq!(
            outcome.rule_matched.as_deref(),
            Some("suspicious_user_agent")
        );
        assert_eq!(outcome.retry_after_seconds, None);
    }

    #[test]
    fn test_sweep_evicts_idle_entries() {
        let controller = controller(GuardConfig {
            sliding_window_seconds: 1,
            ..GuardConfig::default()
        });
        let allow = verdict(MitigationAction::Allow, "baseline");
        controller.apply(ip("9.9.9.9"), &allow);
        assert_eq!(controller.tracked_ips(), 1);
        std::thread::sleep(Duration::from_millis(1100));
        controller.sweep();
        assert_eq!(controller.tracked_ips(), 0);
    }

    #[test]
    fn test_sweep_keeps_actively_blocked_entries() {
        let controller = controller(GuardConfig {
            sliding_window_seconds: 1,
            ..GuardConfig::default()
        });
        controller.apply(ip("6.6.6.6"), &verdict(MitigationAction::Block, "ml_detection"));
        std::thread::sleep(Duration::from_millis(1100));
        controller.sweep();
        assert_eq!(controller.tracked_ips(), 1);
    }

    #[test]
    fn test_baseline_window_recovers() {
        let controller = controller(GuardConfig {
            request_rate_limit: 1,
            sliding_window_seconds: 1,
            ..GuardConfig::default()
        });
        let allow = verdict(MitigationAction::Allow, "baseline");
        assert!(controller.apply(ip("9.9.9.9"), &allow).allowed);
        assert!(!controller.apply(ip("9.9.9.9"), &allow).allowed);
        std::thread::sleep(Duration::from_millis(1100));
        assert!(controller.apply(ip("9.9.9.9"), &allow).allowed);
    }
}
