//! Per-user behaviour model
//!
//! Standardises feature vectors with training-time statistics, scores them
//! with an isolation forest and explains them with the nearest k-means
//! centre. The whole model serialises to one artifact tagged with the
//! feature schema version.

use crate::anomaly::{percentile, IsolationForest, KMeans, StandardScaler};
use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_SCHEMA_VERSION};
use crate::recorder::{BehaviorRecord, DevicePattern};
use crate::{Result, TrackerError};
use chrono::{DateTime, Utc};
use nalgebra::DVector;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tandem_geo::{ZoneId, OUTSIDE_ZONE_ID};

pub const MODEL_TYPE: &str = "isolation_forest";

/// Model hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Fewer records than this refuse to train
    pub min_samples: usize,
    /// Expected outlier share; reported as the contamination offset
    pub contamination: f64,
    /// Training-score percentile used as the decision threshold
    pub anomaly_percentile: f64,
    pub clusters: usize,
    pub kmeans_max_iter: usize,
    pub num_trees: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            min_samples: 30,
            contamination: 0.15,
            anomaly_percentile: 10.0,
            clusters: 3,
            kmeans_max_iter: 300,
            num_trees: 150,
            max_samples: 256,
            seed: 42,
        }
    }
}

/// Summary of a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub schema_version: u32,
    pub trained_at: DateTime<Utc>,
    pub training_started_at: Option<DateTime<Utc>>,
    pub sample_count: usize,
    pub anomaly_threshold: f64,
    pub contamination_offset: f64,
    pub cluster_sizes: Vec<usize>,
}

/// Scoring result for one feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub score: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub assigned_cluster: usize,
    pub cluster_distance: f64,
    pub features: FeatureVector,
}

#[derive(Deserialize)]
struct ArtifactHeader {
    schema_version: u32,
}

/// Trained per-user model; also the persisted artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyModel {
    pub schema_version: u32,
    pub model_type: String,
    pub user_id: String,
    pub feature_count: usize,
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
    pub clusters: KMeans,
    pub cluster_sizes: Vec<usize>,
    pub anomaly_score_threshold: f64,
    pub contamination_offset: f64,
    pub training_started_at: Option<DateTime<Utc>>,
    pub trained_at: DateTime<Utc>,
    pub sample_count: usize,
    /// Most visited zones per device in the training data
    pub typical_zones: BTreeMap<String, Vec<ZoneId>>,
}

impl AnomalyModel {
    /// Fit scaler, forest and clusters on the given records
    pub fn train(
        user_id: &str,
        records: &[BehaviorRecord],
        params: &ModelParams,
        training_started_at: Option<DateTime<Utc>>,
        trained_at: DateTime<Utc>,
    ) -> Result<Self> {
        let required = params.min_samples.max(1);
        if records.len() < required {
            return Err(TrackerError::InsufficientSamples {
                found: records.len(),
                required,
            });
        }

        let rows: Vec<Vec<f64>> = records.iter().map(|r| r.features().to_array().to_vec()).collect();
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            return Err(TrackerError::Training("non-finite feature value".to_string()));
        }

        let scaler = StandardScaler::fit(&rows);
        let scaled: Vec<Vec<f64>> = rows.iter().map(|r| scaler.transform(r)).collect();

        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);

        let mut forest = IsolationForest::new(params.num_trees, params.max_samples);
        forest.fit(&scaled, &mut rng);

        let scores: Vec<f64> = scaled.iter().map(|r| forest.score_samples(r)).collect();
        let anomaly_score_threshold = percentile(&scores, params.anomaly_percentile);
        let contamination_offset = percentile(&scores, params.contamination * 100.0);

        let points: Vec<DVector<f64>> = scaled.into_iter().map(DVector::from_vec).collect();
        let clusters = KMeans::fit(&points, params.clusters, params.kmeans_max_iter, &mut rng);
        let cluster_sizes = clusters.cluster_sizes(&points);

        tracing::info!(
            user_id,
            samples = records.len(),
            "Trained model: threshold {:.4}, offset {:.4}, clusters {:?}",
            anomaly_score_threshold,
            contamination_offset,
            cluster_sizes
        );

        Ok(Self {
            schema_version: FEATURE_SCHEMA_VERSION,
            model_type: MODEL_TYPE.to_string(),
            user_id: user_id.to_string(),
            feature_count: FEATURE_COUNT,
            scaler,
            forest,
            clusters,
            cluster_sizes,
            anomaly_score_threshold,
            contamination_offset,
            training_started_at,
            trained_at,
            sample_count: records.len(),
            typical_zones: typical_zones(records),
        })
    }

    /// Score a feature vector against the training-time statistics
    pub fn score(&self, features: &FeatureVector) -> Score {
        let scaled = self.scaler.transform(&features.to_array());
        let score = self.forest.score_samples(&scaled);
        let (assigned_cluster, cluster_distance) = self.clusters.predict(&DVector::from_vec(scaled));

        Score {
            score,
            threshold: self.anomaly_score_threshold,
            is_anomaly: score < self.anomaly_score_threshold,
            confidence: score.abs(),
            assigned_cluster,
            cluster_distance,
            features: *features,
        }
    }

    /// Prefer live pattern summaries over the training-data estimate
    pub fn adopt_patterns(&mut self, patterns: &[DevicePattern]) {
        for pattern in patterns.iter().filter(|p| !p.typical_zones.is_empty()) {
            self.typical_zones
                .insert(pattern.device_id.clone(), pattern.typical_zones.clone());
        }
    }

    pub fn is_typical_zone(&self, device_id: &str, zone_id: ZoneId) -> bool {
        self.typical_zones
            .get(device_id)
            .map(|zones| zones.contains(&zone_id))
            .unwrap_or(false)
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            model_type: self.model_type.clone(),
            schema_version: self.schema_version,
            trained_at: self.trained_at,
            training_started_at: self.training_started_at,
            sample_count: self.sample_count,
            anomaly_threshold: self.anomaly_score_threshold,
            contamination_offset: self.contamination_offset,
            cluster_sizes: self.cluster_sizes.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TrackerError::Training(format!("Failed to serialize model: {}", e)))
    }

    /// Load an artifact, refusing other feature schema versions
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: ArtifactHeader =
            serde_json::from_slice(bytes).map_err(|e| TrackerError::CorruptArtifact(e.to_string()))?;

        if header.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(TrackerError::SchemaMismatch {
                found: header.schema_version,
                expected: FEATURE_SCHEMA_VERSION,
            });
        }

        let model: Self = serde_json::from_slice(bytes).map_err(|e| TrackerError::CorruptArtifact(e.to_string()))?;

        if model.feature_count != FEATURE_COUNT || model.scaler.width() != FEATURE_COUNT {
            return Err(TrackerError::CorruptArtifact(format!(
                "expected {} features, artifact has {}",
                FEATURE_COUNT, model.feature_count
            )));
        }

        Ok(model)
    }
}

fn typical_zones(records: &[BehaviorRecord]) -> BTreeMap<String, Vec<ZoneId>> {
    let mut visits: HashMap<&str, BTreeMap<ZoneId, usize>> = HashMap::new();
    for r in records {
        *visits.entry(r.device1_id.as_str()).or_default().entry(r.zone1_id).or_insert(0) += 1;
        *visits.entry(r.device2_id.as_str()).or_default().entry(r.zone2_id).or_insert(0) += 1;
    }

    visits
        .into_iter()
        .map(|(device, zones)| {
            let mut ranked: Vec<(ZoneId, usize)> =
                zones.into_iter().filter(|&(zone, _)| zone != OUTSIDE_ZONE_ID).collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            (device.to_string(), ranked.into_iter().take(3).map(|(z, _)| z).collect())
        })
        .collect()
}
