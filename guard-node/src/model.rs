use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::config::SensitivityProfile;
use crate::error::{GuardError, Result};
use crate::features::FeatureVector;
use crate::types::Prediction;

/// File name of the exported classifier inside the model directory.
pub const MODEL_FILE: &str = "model.json";

/// Trained classifier parameters produced by the offline training pipeline:
/// robust-scaler center/scale, a linear logit over the scaled features
/// (positive logit means benign) and per-feature importances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub feature_names: Vec<String>,
    pub center: Vec<f64>,
    pub scale: Vec<f64>,
    pub weights: Vec<f64>,
    pub intercept: f64,
    pub importance: Vec<f64>,
}

/// In-memory classifier evaluating one feature vector at a time.
#[derive(Debug, Clone)]
pub struct DetectionModel {
    feature_names: Vec<String>,
    center: Array1<f64>,
    scale: Array1<f64>,
    weights: Array1<f64>,
    intercept: f64,
    importance: Vec<f64>,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl DetectionModel {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self> {
        let n = artifact.feature_names.len();
        if n == 0 {
            return Err(GuardError::Prediction(
                "model artifact declares no features".to_string(),
            ));
        }
        if artifact.center.len() != n
            || artifact.scale.len() != n
            || artifact.weights.len() != n
            || artifact.importance.len() != n
        {
            return Err(GuardError::Prediction(format!(
                "model artifact dimensions do not match {n} features"
            )));
        }
        // A zero scale would divide away the feature entirely.
        let scale: Vec<f64> = artifact
            .scale
            .iter()
            .map(|s| if *s == 0.0 { 1.0 } else { *s })
            .collect();
        Ok(Self {
            feature_names: artifact.feature_names,
            center: Array1::from_vec(artifact.center),
            scale: Array1::from_vec(scale),
            weights: Array1::from_vec(artifact.weights),
            intercept: artifact.intercept,
            importance: artifact.importance,
        })
    }

    /// Load the exported classifier from `<dir>/model.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MODEL_FILE);
        let raw = std::fs::read(&path).map_err(|e| {
            GuardError::Prediction(format!("cannot read model file {}: {e}", path.display()))
        })?;
        let artifact: ModelArtifact = serde_json::from_slice(&raw).map_err(|e| {
            GuardError::Prediction(format!("cannot parse model file {}: {e}", path.display()))
        })?;
        let model = Self::from_artifact(artifact)?;
        info!(
            path = %path.display(),
            features = model.feature_names.len(),
            "detection model loaded"
        );
        Ok(model)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Score one feature vector against the given sensitivity profile.
    ///
    /// `risk_score = (1 - P(benign)) * 100`; the request counts as an attack
    /// only when both the confidence and the risk score clear the profile's
    /// thresholds.
    pub fn predict(
        &self,
        features: &FeatureVector,
        profile: &SensitivityProfile,
    ) -> Result<Prediction> {
        let named: HashMap<&str, f64> = features.named().into_iter().collect();
        let raw = Array1::from_vec(
            self.feature_names
                .iter()
                .map(|name| named.get(name.as_str()).copied().unwrap_or(0.0))
                .collect(),
        );
        let scaled = (&raw - &self.center) / &self.scale;
        let logit = scaled.dot(&self.weights) + self.intercept;
        if !logit.is_finite() {
            return Err(GuardError::Prediction(
                "model produced a non-finite score".to_string(),
            ));
        }
        let p_benign = sigmoid(logit);
        let confidence = p_benign.max(1.0 - p_benign);
        let risk_score = (1.0 - p_benign) * 100.0;
        let is_attack = confidence >= profile.confidence_threshold
            && risk_score >= profile.risk_score_threshold;

        let feature_contributions = self
            .feature_names
            .iter()
            .zip(scaled.iter())
            .zip(self.importance.iter())
            .map(|((name, value), importance)| (name.clone(), (value * importance).abs()))
            .collect();

        Ok(Prediction {
            is_benign: !is_attack,
            risk_score,
            confidence,
            feature_contributions,
        })
    }
}
