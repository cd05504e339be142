use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::{GuardError, Result};

/// Seconds since the Unix epoch as a float, the clock used for window math.
pub fn unix_now() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(_) => 0.0,
    }
}

/// A single request observation retained while inside the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowEvent {
    pub timestamp: f64,
    pub content_length: u64,
}

/// Point-in-time aggregate over the sliding window. Returned by value;
/// never retains references into the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub ip_event_count: usize,
    pub global_event_count: usize,
    pub ip_request_rate: f64,
    pub global_request_rate: f64,
    pub unique_ip_count: usize,
}

#[derive(Debug, Default)]
struct WindowState {
    per_ip: HashMap<IpAddr, VecDeque<WindowEvent>>,
    global: VecDeque<f64>,
    active_ips: HashMap<IpAddr, f64>,
}

/// Tracks request activity over a sliding time window.
///
/// One mutex guards the whole store; every operation prunes before it
/// reports, so an event is observable only while `t > now - W` holds.
#[derive(Debug)]
pub struct SlidingWindowStore {
    window_seconds: f64,
    state: Mutex<WindowState>,
}

impl SlidingWindowStore {
    pub fn new(window_seconds: i64) -> Result<Self> {
        if window_seconds <= 0 {
            return Err(GuardError::Config(
                "sliding_window_seconds must be positive".to_string(),
            ));
        }
        Ok(Self {
            window_seconds: window_seconds as f64,
            state: Mutex::new(WindowState::default()),
        })
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    /// Record an event for an IP and return updated metrics.
    pub fn add_event(
        &self,
        ip: IpAddr,
        content_length: u64,
        timestamp: Option<f64>,
    ) -> WindowSnapshot {
        let now = timestamp.unwrap_or_else(unix_now);
        let mut state = self.lock();
        state
            .per_ip
            .entry(ip)
            .or_default()
            .push_back(WindowEvent {
                timestamp: now,
                content_length,
            });
        state.active_ips.insert(ip, now);
        state.global.push_back(now);
        self.prune(&mut state, now);
        self.snapshot_for(&state, Some(ip))
    }

    /// Return current metrics for an IP without adding a new event.
    pub fn peek(&self, ip: IpAddr, timestamp: Option<f64>) -> WindowSnapshot {
        let now = timestamp.unwrap_or_else(unix_now);
        let mut state = self.lock();
        self.prune(&mut state, now);
        self.snapshot_for(&state, Some(ip))
    }

    /// Return aggregate metrics without focusing on a specific IP.
    pub fn snapshot(&self, timestamp: Option<f64>) -> WindowSnapshot {
        let now = timestamp.unwrap_or_else(unix_now);
        let mut state = self.lock();
        self.prune(&mut state, now);
        self.snapshot_for(&state, None)
    }

    /// In-window event history for an IP, oldest first.
    pub fn ip_events(&self, ip: IpAddr, timestamp: Option<f64>) -> Vec<WindowEvent> {
        let now = timestamp.unwrap_or_else(unix_now);
        let mut state = self.lock();
        self.prune(&mut state, now);
        state
            .per_ip
            .get(&ip)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Prune expired events without reporting anything; called by the
    /// background sweeper in addition to lazy prune-on-access.
    pub fn sweep(&self) {
        let now = unix_now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        debug!(
            active_ips = state.active_ips.len(),
            global_events = state.global.len(),
            "sliding window sweep completed"
        );
    }

    /// Start the periodic sweeper task.
    pub fn start_sweeper(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("sliding window mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn prune(&self, state: &mut WindowState, now: f64) {
        let window_start = now - self.window_seconds;

        while state
            .global
            .front()
            .map_or(false, |t| *t <= window_start)
        {
            state.global.pop_front();
        }

        let expired: Vec<IpAddr> = {
            let mut gone = Vec::new();
            for (ip, queue) in state.per_ip.iter_mut() {
                while queue
                    .front()
                    .map_or(false, |event| event.timestamp <= window_start)
                {
                    queue.pop_front();
                }
                if queue.is_empty() {
                    gone.push(*ip);
                }
            }
            gone
        };
        for ip in expired {
            state.per_ip.remove(&ip);
            state.active_ips.remove(&ip);
        }

        // Safety guard: drop active entries whose last activity left the window.
        state.active_ips.retain(|_, last_seen| *last_seen > window_start);
    }

    fn snapshot_for(&self, state: &WindowState, ip: Option<IpAddr>) -> WindowSnapshot {
        let ip_event_count = ip
            .and_then(|ip| state.per_ip.get(&ip))
            .map(VecDeque::len)
            .unwrap_or(0);
        let global_event_count = state.global.len();
        WindowSnapshot {
            ip_event_count,
            global_event_count,
            ip_request_rate: ip_event_count as f64 / self.window_seconds,
            global_request_rate: global_event_count as f64 / self.window_seconds,
            unique_ip_count: state.active_ips.len(),
        }
    }
}
