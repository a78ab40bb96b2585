// Application Configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tandem_behavior::{HeuristicPolicy, ModelParams, PanelPolicy, SchedulerConfig, TrackerConfig, ZoneCurfew};
use tandem_geo::{LayoutConfig, ValidatorConfig};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Data directory for model artifacts and the notification journal
    #[serde(default = "default_data_dir")]
    pub data_directory: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Fixes reporting worse accuracy are rejected (meters)
    #[serde(default = "default_max_accuracy")]
    pub max_acceptable_accuracy_m: f64,

    /// Fixes reporting better accuracy become the device anchor (meters)
    #[serde(default = "default_high_accuracy")]
    pub high_accuracy_threshold_m: f64,

    /// Largest drift from the anchor for medium-accuracy fixes (meters)
    #[serde(default = "default_max_drift")]
    pub max_drift_m: f64,

    /// Side of the campus footprint in degrees
    #[serde(default = "default_footprint")]
    pub zone_footprint_deg: f64,

    /// Records needed before training on count alone
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,

    /// Collection window after which training starts with fewer records
    #[serde(default = "default_training_window")]
    pub training_window_minutes: f64,

    /// Floor for a window-triggered fit
    #[serde(default = "default_min_window_samples")]
    pub min_window_samples: usize,

    /// Records read back for training
    #[serde(default = "default_behavior_read_limit")]
    pub behavior_read_limit: usize,

    /// Expected outlier share
    #[serde(default = "default_contamination")]
    pub contamination_fraction: f64,

    /// Training-score percentile used as the anomaly threshold
    #[serde(default = "default_anomaly_percentile")]
    pub anomaly_percentile: f64,

    #[serde(default = "default_forest_trees")]
    pub forest_trees: usize,

    #[serde(default = "default_forest_seed")]
    pub forest_seed: u64,

    /// Companion fixes older than this are not paired (seconds)
    #[serde(default = "default_pair_freshness")]
    pub pair_freshness_seconds: i64,

    /// Speeds above this are implausible for a carried device (m/s)
    #[serde(default = "default_max_speed")]
    pub heuristic_max_speed_mps: f64,

    /// corroborated | union
    #[serde(default)]
    pub panel_policy: PanelPolicy,

    /// Zones flagged after a given hour
    #[serde(default = "default_curfews")]
    pub curfews: Vec<ZoneCurfew>,

    /// Path to config file (for reference)
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_data_dir() -> String { "/var/lib/tandem/data".to_string() }
fn default_max_accuracy() -> f64 { ValidatorConfig::default().max_acceptable_accuracy_m }
fn default_high_accuracy() -> f64 { ValidatorConfig::default().high_accuracy_threshold_m }
fn default_max_drift() -> f64 { ValidatorConfig::default().max_drift_m }
fn default_footprint() -> f64 { LayoutConfig::default().footprint_deg }
fn default_min_training_samples() -> usize { SchedulerConfig::default().min_training_samples }
fn default_training_window() -> f64 { SchedulerConfig::default().training_window_minutes }
fn default_min_window_samples() -> usize { SchedulerConfig::default().min_window_samples }
fn default_behavior_read_limit() -> usize { SchedulerConfig::default().behavior_read_limit }
fn default_contamination() -> f64 { ModelParams::default().contamination }
fn default_anomaly_percentile() -> f64 { ModelParams::default().anomaly_percentile }
fn default_forest_trees() -> usize { ModelParams::default().num_trees }
fn default_forest_seed() -> u64 { ModelParams::default().seed }
fn default_pair_freshness() -> i64 { TrackerConfig::default().pair_freshness_seconds }
fn default_max_speed() -> f64 { HeuristicPolicy::default().max_speed_mps }
fn default_curfews() -> Vec<ZoneCurfew> { HeuristicPolicy::default().curfews }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_dir(),
            log_json: false,
            max_acceptable_accuracy_m: default_max_accuracy(),
            high_accuracy_threshold_m: default_high_accuracy(),
            max_drift_m: default_max_drift(),
            zone_footprint_deg: default_footprint(),
            min_training_samples: default_min_training_samples(),
            training_window_minutes: default_training_window(),
            min_window_samples: default_min_window_samples(),
            behavior_read_limit: default_behavior_read_limit(),
            contamination_fraction: default_contamination(),
            anomaly_percentile: default_anomaly_percentile(),
            forest_trees: default_forest_trees(),
            forest_seed: default_forest_seed(),
            pair_freshness_seconds: default_pair_freshness(),
            heuristic_max_speed_mps: default_max_speed(),
            panel_policy: PanelPolicy::default(),
            curfews: default_curfews(),
            config_path: PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from standard paths
    pub fn load() -> Result<Self> {
        let config_paths = [
            PathBuf::from("/etc/tandem/config.toml"),
            dirs::config_dir()
                .map(|p| p.join("tandem/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("./config.toml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from(path);
            }
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate example configuration
    pub fn example() -> String {
        let config = Self {
            data_directory: "./tandem-data".to_string(),
            ..Default::default()
        };

        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn models_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_directory).join("models")
    }

    pub fn journal_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_directory).join("journal")
    }

    /// Library configuration built from the named parameters
    pub fn tracker_config(&self) -> TrackerConfig {
        let defaults = TrackerConfig::default();

        TrackerConfig {
            validator: ValidatorConfig {
                max_acceptable_accuracy_m: self.max_acceptable_accuracy_m,
                high_accuracy_threshold_m: self.high_accuracy_threshold_m,
                max_drift_m: self.max_drift_m,
            },
            layout: LayoutConfig {
                footprint_deg: self.zone_footprint_deg,
                ..defaults.layout
            },
            scheduler: SchedulerConfig {
                min_training_samples: self.min_training_samples,
                training_window_minutes: self.training_window_minutes,
                behavior_read_limit: self.behavior_read_limit,
                min_window_samples: self.min_window_samples,
            },
            model: ModelParams {
                min_samples: self.min_training_samples,
                contamination: self.contamination_fraction,
                anomaly_percentile: self.anomaly_percentile,
                num_trees: self.forest_trees,
                seed: self.forest_seed,
                ..defaults.model
            },
            heuristics: HeuristicPolicy {
                max_speed_mps: self.heuristic_max_speed_mps,
                curfews: self.curfews.clone(),
            },
            panel_policy: self.panel_policy,
            pair_freshness_seconds: self.pair_freshness_seconds,
        }
    }
}

/// Helper for getting config directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
