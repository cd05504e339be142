use std::sync::Arc;

use crate::types::TrafficSample;
use crate::window::{SlidingWindowStore, WindowEvent, WindowSnapshot};

/// Guards the burst denominator against division by zero.
const BURST_EPSILON: f64 = 1e-6;

/// Ordered feature set handed to the detection engine and, through its
/// named view, to the classifier boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    // Edge-level rates
    pub ip_request_rate: f64,
    pub global_request_rate: f64,
    pub unique_ip_count: usize,
    /// Ratio of this IP's rate to the average per-IP rate at the edge
    pub burst_score: f64,

    // Flow statistics over the per-IP window history
    pub flow_duration: f64,
    pub total_fwd_packets: f64,
    pub total_bwd_packets: f64,
    pub total_fwd_bytes: f64,
    pub total_bwd_bytes: f64,
    pub flow_bytes_per_sec: f64,
    pub flow_packets_per_sec: f64,
    pub flow_iat_mean: f64,
    pub flow_iat_std: f64,
    pub flow_iat_max: f64,
    pub flow_iat_min: f64,
    pub fwd_iat_mean: f64,
    pub fwd_iat_std: f64,
    pub fwd_iat_max: f64,
    pub fwd_iat_min: f64,
    pub fwd_packet_length_max: f64,
    pub fwd_packet_length_min: f64,
    pub psh_flag_count: f64,
    pub average_packet_size: f64,
    pub packet_length_std: f64,
}

impl FeatureVector {
    /// The named view of the flow statistics, using the exact names the
    /// trained model was fit on. Order is fixed.
    pub fn named(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("Flow Duration", self.flow_duration),
            ("Total Fwd Packets", self.total_fwd_packets),
            ("Total Backward Packets", self.total_bwd_packets),
            ("Total Length of Fwd Packets", self.total_fwd_bytes),
            ("Total Length of Bwd Packets", self.total_bwd_bytes),
            ("Fwd Packet Length Max", self.fwd_packet_length_max),
            ("Fwd Packet Length Min", self.fwd_packet_length_min),
            ("Flow IAT Mean", self.flow_iat_mean),
            ("Flow IAT Std", self.flow_iat_std),
            ("Flow IAT Max", self.flow_iat_max),
            ("Flow IAT Min", self.flow_iat_min),
            ("Fwd IAT Mean", self.fwd_iat_mean),
            ("Fwd IAT Std", self.fwd_iat_std),
            ("Fwd IAT Max", self.fwd_iat_max),
            ("Fwd IAT Min", self.fwd_iat_min),
            ("Flow Bytes/s", self.flow_bytes_per_sec),
            ("Flow Packets/s", self.flow_packets_per_sec),
            ("PSH Flag Count", self.psh_flag_count),
            ("Average Packet Size", self.average_packet_size),
            ("Packet Length Std", self.packet_length_std),
        ]
    }

    /// Canonical serialization used as the prediction cache key input.
    /// Field order is fixed, so equal vectors always produce equal strings.
    pub fn cache_repr(&self) -> String {
        let mut parts = vec![
            format!("ip_request_rate:{}", self.ip_request_rate),
            format!("global_request_rate:{}", self.global_request_rate),
            format!("unique_ip_count:{}", self.unique_ip_count),
            format!("burst_score:{}", self.burst_score),
        ];
        for (name, value) in self.named() {
            parts.push(format!("{name}:{value}"));
        }
        parts.join(",")
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Derives the per-request feature vector. Computing features records the
/// request in the sliding window store first, so the resulting snapshot
/// already includes the current event.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    store: Arc<SlidingWindowStore>,
}

impl FeatureExtractor {
    pub fn new(store: Arc<SlidingWindowStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SlidingWindowStore> {
        &self.store
    }

    pub fn compute(&self, sample: &TrafficSample) -> FeatureVector {
        let snapshot = self.store.add_event(
            sample.client_ip,
            sample.content_length,
            Some(sample.timestamp),
        );
        let events = self.store.ip_events(sample.client_ip, Some(sample.timestamp));
        Self::build(&snapshot, &events, self.store.window_seconds())
    }

    fn build(
        snapshot: &WindowSnapshot,
        events: &[WindowEvent],
        window_seconds: f64,
    ) -> FeatureVector {
        let burst_score = if snapshot.ip_request_rate > 0.0 {
            let average_rate = (snapshot.global_request_rate
                / snapshot.unique_ip_count.max(1) as f64)
                .max(BURST_EPSILON);
            snapshot.ip_request_rate / average_rate
        } else {
            0.0
        };

        let timestamps: Vec<f64> = events.iter().map(|e| e.timestamp).collect();
        let iats: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
        let (iat_mean, iat_std, iat_max, iat_min) = if iats.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let m = mean(&iats);
            (
                m,
                std_dev(&iats, m),
                iats.iter().cloned().fold(f64::MIN, f64::max),
                iats.iter().cloned().fold(f64::MAX, f64::min),
            )
        };

        let sizes: Vec<f64> = events.iter().map(|e| e.content_length as f64).collect();
        let total_bytes: f64 = sizes.iter().sum();
        let (size_max, size_min, size_mean, size_std) = if sizes.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let m = mean(&sizes);
            (
                sizes.iter().cloned().fold(f64::MIN, f64::max),
                sizes.iter().cloned().fold(f64::MAX, f64::min),
                m,
                std_dev(&sizes, m),
            )
        };

        FeatureVector {
            ip_request_rate: snapshot.ip_request_rate,
            global_request_rate: snapshot.global_request_rate,
            unique_ip_count: snapshot.unique_ip_count,
            burst_score,
            flow_duration: window_seconds,
            total_fwd_packets: events.len() as f64,
            total_bwd_packets: 0.0,
            total_fwd_bytes: total_bytes,
            total_bwd_bytes: 0.0,
            flow_bytes_per_sec: total_bytes / window_seconds,
            flow_packets_per_sec: events.len() as f64 / window_seconds,
            flow_iat_mean: iat_mean,
            flow_iat_std: iat_std,
            flow_iat_max: iat_max,
            flow_iat_min: iat_min,
            fwd_iat_mean: iat_mean,
            fwd_iat_std: iat_std,
            fwd_iat_max: iat_max,
            fwd_iat_min: iat_min,
            fwd_packet_length_max: size_max,
            fwd_packet_length_min: size_min,
            psh_flag_count: 0.0,
            average_packet_size: size_mean,
            packet_length_std: size_std,
        }
    }
}
