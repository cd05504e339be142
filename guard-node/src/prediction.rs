use lru::LruCache;
use metrics::{counter, histogram};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{GuardConfig, SensitivityLevel};
use crate::features::FeatureVector;
use crate::model::DetectionModel;
use crate::types::Prediction;

/// How long the worker waits for more requests before evaluating a batch.
const BATCH_GATHER_TIMEOUT: Duration = Duration::from_millis(100);
/// How long a waiter suspends on the batch before evaluating directly.
const WAITER_DEADLINE: Duration = Duration::from_millis(250);

struct CacheEntry {
    prediction: Prediction,
    stored_at: Instant,
}

struct InferenceRequest {
    key: String,
    features: FeatureVector,
    sensitivity: SensitivityLevel,
}

struct Shared {
    model: RwLock<Option<DetectionModel>>,
    cache: Option<Mutex<LruCache<String, CacheEntry>>>,
    cache_ttl: Duration,
    /// Waiters per in-flight cache key; at most one evaluation is queued
    /// per distinct key.
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<Prediction>>>>,
    degraded_warned: AtomicBool,
}

impl Shared {
    fn cache_get(&self, key: &str) -> Option<Prediction> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock().ok()?;
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.cache_ttl => {
                Some(entry.prediction.clone())
            }
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: &str, prediction: &Prediction) {
        if let Some(cache) = self.cache.as_ref() {
            if let Ok(mut cache) = cache.lock() {
                cache.put(
                    key.to_string(),
                    CacheEntry {
                        prediction: prediction.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
        }
    }

    fn cache_clear(&self) {
        if let Some(cache) = self.cache.as_ref() {
            if let Ok(mut cache) = cache.lock() {
                cache.clear();
            }
        }
    }

    /// Run the model on one feature vector, degrading to the neutral
    /// prediction on any failure so the request path never sees an error.
    fn evaluate(&self, features: &FeatureVector, sensitivity: SensitivityLevel) -> Prediction {
        let profile = sensitivity.profile();
        let guard = match self.model.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(model) = guard.as_ref() else {
            if !self.degraded_warned.swap(true, Ordering::Relaxed) {
                warn!("no detection model available, running heuristics-only");
            }
            return Prediction::neutral();
        };
        let started = Instant::now();
        match model.predict(features, &profile) {
            Ok(prediction) => {
                histogram!(
                    "ddos_model_inference_seconds",
                    started.elapsed().as_secs_f64()
                );
                prediction
            }
            Err(err) => {
                counter!("ddos_prediction_errors_total", 1);
                if !self.degraded_warned.swap(true, Ordering::Relaxed) {
                    warn!(error = %err, "model evaluation failed, running heuristics-only");
                }
                Prediction::neutral()
            }
        }
    }

    /// Evaluate, cache, and fan the result out to every waiter on the key.
    fn evaluate_and_complete(
        &self,
        key: &str,
        features: &FeatureVector,
        sensitivity: SensitivityLevel,
    ) -> Prediction {
        let prediction = self.evaluate(features, sensitivity);
        self.cache_put(key, &prediction);
        let waiters = match self.pending.lock() {
            Ok(mut pending) => pending.remove(key).unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().remove(key).unwrap_or_default(),
        };
        for waiter in waiters {
            let _ = waiter.send(prediction.clone());
        }
        prediction
    }
}

/// Asynchronous classifier front end: bounded cache, request batching with
/// single-flight per cache key, and a direct-evaluation fallback when the
/// batch path is saturated or slow.
pub struct PredictionService {
    shared: Arc<Shared>,
    queue_tx: mpsc::Sender<InferenceRequest>,
    min_samples: usize,
    model_path: PathBuf,
    reload_interval: Duration,
}

fn cache_key(features: &FeatureVector, sensitivity: SensitivityLevel) -> String {
    let mut hasher = Sha256::new();
    hasher.update(features.cache_repr().as_bytes());
    hasher.update(b":");
    hasher.update(sensitivity.as_str().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl PredictionService {
    /// Build the service and spawn its batch worker. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: &GuardConfig) -> Self {
        let model_path = PathBuf::from(&config.model_path);
        let model = match DetectionModel::load(&model_path) {
            Ok(model) => Some(model),
            Err(err) => {
                warn!(
                    model_path = %model_path.display(),
                    error = %err,
                    "detection model unavailable at startup, degrading to heuristics-only"
                );
                None
            }
        };

        let cache = if config.enable_model_cache {
            let capacity = NonZeroUsize::new(config.model_cache_max_size)
                .unwrap_or(NonZeroUsize::MIN);
            Some(Mutex::new(LruCache::new(capacity)))
        } else {
            None
        };

        let shared = Arc::new(Shared {
            model: RwLock::new(model),
            cache,
            cache_ttl: config.model_cache_ttl(),
            pending: Mutex::new(HashMap::new()),
            degraded_warned: AtomicBool::new(false),
        });

        let batch_size = config.batch_prediction_size.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(batch_size * 4);
        let worker_shared = Arc::clone(&shared);
        tokio::spawn(run_batch_worker(worker_shared, queue_rx, batch_size));

        Self {
            shared,
            queue_tx,
            min_samples: config.min_samples_required,
            model_path,
            reload_interval: config.model_update_interval(),
        }
    }

    /// Classify one feature vector. Deterministic per `(features,
    /// sensitivity)` while the cached entry lives; never returns an error.
    pub async fn predict(
        &self,
        features: &FeatureVector,
        sensitivity: SensitivityLevel,
    ) -> Prediction {
        if (features.total_fwd_packets as usize) < self.min_samples {
            return Prediction::neutral();
        }

        let key = cache_key(features, sensitivity);
        if let Some(hit) = self.shared.cache_get(&key) {
            counter!("ddos_prediction_cache_hits_total", 1);
            return hit;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let first_waiter = {
            let mut pending = match self.shared.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match pending.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(reply_tx);
                    false
                }
                None => {
                    pending.insert(key.clone(), vec![reply_tx]);
                    true
                }
            }
        };

        if first_waiter {
            let request = InferenceRequest {
                key: key.clone(),
                features: features.clone(),
                sensitivity,
            };
            if self.queue_tx.try_send(request).is_err() {
                // Queue saturated or worker gone: evaluate on the caller.
                counter!("ddos_prediction_queue_overflows_total", 1);
                return self
                    .shared
                    .evaluate_and_complete(&key, features, sensitivity);
            }
        }

        match tokio::time::timeout(WAITER_DEADLINE, reply_rx).await {
            Ok(Ok(prediction)) => prediction,
            _ => {
                debug!("prediction wait deadline hit, evaluating directly");
                let prediction = self.shared.evaluate(features, sensitivity);
                self.shared.cache_put(&key, &prediction);
                prediction
            }
        }
    }

    /// Drop every cached prediction.
    pub fn invalidate_cache(&self) {
        self.shared.cache_clear();
    }

    /// Swap in a freshly loaded model and clear the cache.
    pub fn reload_model(&self) -> crate::error::Result<()> {
        let model = DetectionModel::load(&self.model_path)?;
        match self.shared.model.write() {
            Ok(mut slot) => *slot = Some(model),
            Err(poisoned) => *poisoned.into_inner() = Some(model),
        }
        self.shared.degraded_warned.store(false, Ordering::Relaxed);
        self.shared.cache_clear();
        info!(model_path = %self.model_path.display(), "detection model reloaded");
        Ok(())
    }

    pub fn model_available(&self) -> bool {
        match self.shared.model.read() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Watch the model file and reload it when its mtime changes.
    pub fn start_reload_watcher(self: Arc<Self>) {
        let file = self.model_path.join(crate::model::MODEL_FILE);
        let period = self.reload_interval;
        tokio::spawn(async move {
            let mut last_modified: Option<SystemTime> = modified_at(&file);
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let current = modified_at(&file);
                if current.is_some() && current != last_modified {
                    match self.reload_model() {
                        Ok(()) => last_modified = current,
                        Err(err) => {
                            warn!(error = %err, "scheduled model reload failed");
                        }
                    }
                }
            }
        });
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.shared
            .cache
            .as_ref()
            .and_then(|cache| cache.lock().ok().map(|c| c.len()))
            .unwrap_or(0)
    }
}

fn modified_at(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Drains the request queue in chunks of up to `batch_size`, evaluating each
/// distinct key once and fanning results out to every waiter.
async fn run_batch_worker(
    shared: Arc<Shared>,
    mut queue_rx: mpsc::Receiver<InferenceRequest>,
    batch_size: usize,
) {
    debug!("prediction batch worker started");
    while let Some(first) = queue_rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::sleep(BATCH_GATHER_TIMEOUT);
        tokio::pin!(deadline);
        while batch.len() < batch_size {
            tokio::select! {
                _ = &mut deadline => break,
                item = queue_rx.recv() => match item {
                    Some(request) => batch.push(request),
                    None => break,
                },
            }
        }
        for request in batch {
            shared.evaluate_and_complete(&request.key, &request.features, request.sensitivity);
        }
    }
    debug!("prediction batch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureExtractor;
    use crate::model::{ModelArtifact, MODEL_FILE};
    use crate::types::TrafficSample;
    use crate::window::SlidingWindowStore;
    use axum::http::HeaderMap;

    fn features_for(addr: &str, ts: f64) -> FeatureVector {
        let extractor =
            FeatureExtractor::new(Arc::new(SlidingWindowStore::new(60).unwrap()));
        let mut sample =
            TrafficSample::new(addr.parse().unwrap(), "GET", "/", &HeaderMap::new(), 64);
        sample.timestamp = ts;
        extractor.compute(&sample)
    }

    fn write_model(dir: &std::path::Path, intercept: f64) {
        std::fs::create_dir_all(dir).unwrap();
        let artifact = ModelArtifact {
            feature_names: vec!["Flow Duration".to_string(), "Total Fwd Packets".to_string()],
            center: vec![0.0, 0.0],
            scale: vec![1.0, 1.0],
            weights: vec![0.0, 0.0],
            intercept,
            importance: vec![0.5, 0.5],
        };
        std::fs::write(
            dir.join(MODEL_FILE),
            serde_json::to_vec(&artifact).unwrap(),
        )
        .unwrap();
    }

    fn test_config(model_dir: &std::path::Path) -> GuardConfig {
        GuardConfig {
            model_path: model_dir.display().to_string(),
            min_samples_required: 1,
            ..GuardConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_model_degrades_to_neutral() {
        let dir = std::env::temp_dir().join("guard-pred-missing");
        let service = PredictionService::new(&test_config(&dir));
        assert!(!service.model_available());
        let prediction = service
            .predict(&features_for("1.2.3.4", 1_000_000.0), SensitivityLevel::Medium)
            .await;
        assert!(prediction.is_benign);
        assert_eq!(prediction.risk_score, 0.0);
        assert_eq!(prediction.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_identical_prediction() {
        let dir = std::env::temp_dir()
            .join(format!("guard-pred-cache-{}", std::process::id()));
        write_model(&dir, -4.0);
        let service = PredictionService::new(&test_config(&dir));
        let features = features_for("1.2.3.4", 1_000_000.0);

        let first = service.predict(&features, SensitivityLevel::Medium).await;
        let second = service.predict(&features, SensitivityLevel::Medium).await;
        assert_eq!(first.risk_score, second.risk_score);
        assert_eq!(first.is_benign, second.is_benign);
        assert_eq!(service.cache_len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_sensitivity_levels_use_distinct_cache_keys() {
        let dir = std::env::temp_dir()
            .join(format!("guard-pred-sens-{}", std::process::id()));
        write_model(&dir, 0.0);
        let service = PredictionService::new(&test_config(&dir));
        let features = features_for("1.2.3.4", 1_000_000.0);

        service.predict(&features, SensitivityLevel::Low).await;
        service.predict(&features, SensitivityLevel::High).await;
        assert_eq!(service.cache_len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_reload_clears_cache() {
        let dir = std::env::temp_dir()
            .join(format!("guard-pred-reload-{}", std::process::id()));
        write_model(&dir, -4.0);
        let service = PredictionService::new(&test_config(&dir));
        let features = features_for("1.2.3.4", 1_000_000.0);

        let before = service.predict(&features, SensitivityLevel::Medium).await;
        assert!(!before.is_benign);
        assert_eq!(service.cache_len(), 1);

        write_model(&dir, 4.0);
        service.reload_model().unwrap();
        assert_eq!(service.cache_len(), 0);

        let after = service.predict(&features, SensitivityLevel::Medium).await;
        assert!(after.is_benign);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_min_samples_floor_skips_model() {
        let dir = std::env::temp_dir()
            .join(format!("guard-pred-floor-{}", std::process::id()));
        write_model(&dir, -4.0);
        let mut config = test_config(&dir);
        config.min_samples_required = 5;
        let service = PredictionService::new(&config);

        // A single event is below the floor, so the hostile model is ignored.
        let prediction = service
            .predict(&features_for("1.2.3.4", 1_000_000.0), SensitivityLevel::Medium)
            .await;
        assert!(prediction.is_benign);
        assert_eq!(service.cache_len(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let dir = std::env::temp_dir()
            .join(format!("guard-pred-ttl-{}", std::process::id()));
        write_model(&dir, -4.0);
        let mut config = test_config(&dir);
        config.model_cache_ttl_seconds = 0;
        let service = PredictionService::new(&config);
        let features = features_for("1.2.3.4", 1_000_000.0);

        service.predict(&features, SensitivityLevel::Medium).await;
        // TTL of zero expires immediately; the stale entry must be dropped
        // rather than served.
        let prediction = service.predict(&features, SensitivityLevel::Medium).await;
        assert!(!prediction.is_benign);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_same_key() {
        let dir = std::env::temp_dir()
            .join(format!("guard-pred-flight-{}", std::process::id()));
        write_model(&dir, -4.0);
        let service = Arc::new(PredictionService::new(&test_config(&dir)));
        let features = features_for("1.2.3.4", 1_000_000.0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let features = features.clone();
            handles.push(tokio::spawn(async move {
                service.predict(&features, SensitivityLevel::Medium).await
            }));
        }
        for handle in handles {
            let prediction = handle.await.unwrap();
            assert!(!prediction.is_benign);
        }
        assert_eq!(service.cache_len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
