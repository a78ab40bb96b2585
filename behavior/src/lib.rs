//! Tandem Behaviour Engine
//!
//! Records pairwise co-location behaviour between a user's devices, learns
//! each user's normal pattern, and raises alerts when the pattern breaks.
//!
//! Control flow for one incoming fix:
//! validate → classify zone → record pair behaviour → train if due → judge.

pub mod anomaly;
pub mod features;
pub mod journal;
pub mod judge;
pub mod model;
pub mod recorder;
pub mod store;
pub mod tracker;
pub mod training;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tandem_geo::{GeoError, Position, ValidationReason};
use tokio::sync::mpsc;

pub use features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES, FEATURE_SCHEMA_VERSION};
pub use journal::{JournalEntry, NotificationJournal};
pub use judge::{HeuristicPolicy, PanelPolicy, ZoneCurfew};
pub use model::{AnomalyModel, ModelInfo, ModelParams};
pub use recorder::{BehaviorRecord, BehaviorRecorder, DevicePattern, PairSummary, PatternSummary};
pub use store::{ArtifactStore, DocumentStore, FileArtifactStore, MemoryArtifactStore, MemoryStore};
pub use tracker::{Tracker, TrackerConfig, ValidationOutcome};
pub use training::{SchedulerConfig, StartOutcome, TrainingPhase, TrainingState, TrainingStatusView};

/// Events delivered to the notification layer, one ordered stream per user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    LocationUpdate {
        device_id: String,
        position: Position,
        accuracy_m: f64,
        timestamp: DateTime<Utc>,
        validation_reason: ValidationReason,
        zone_name: String,
    },
    LocationRejected {
        device_id: String,
        reason: ValidationReason,
        original_accuracy_m: f64,
    },
    MlStatusUpdate {
        phase: TrainingPhase,
        is_training: bool,
        is_trained: bool,
        sample_count: usize,
        message: String,
    },
    MlTrainingProgress {
        samples: usize,
        target_samples: usize,
        elapsed_minutes: f64,
        target_minutes: f64,
        message: String,
    },
    MlTrainingComplete {
        message: String,
        samples: usize,
        model_info: ModelInfo,
    },
    AnomalyAlert(AnomalyAlert),
    IndividualAnomaly {
        device_id: String,
        reasons: Vec<String>,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Notification::LocationUpdate { .. } => "location_update",
            Notification::LocationRejected { .. } => "location_rejected",
            Notification::MlStatusUpdate { .. } => "ml_status_update",
            Notification::MlTrainingProgress { .. } => "ml_training_progress",
            Notification::MlTrainingComplete { .. } => "ml_training_complete",
            Notification::AnomalyAlert(_) => "anomaly_alert",
            Notification::IndividualAnomaly { .. } => "individual_anomaly",
        }
    }
}

/// Pairwise anomaly alert payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyAlert {
    pub message: String,
    pub device1_id: String,
    pub device2_id: String,
    pub device1_zone: String,
    pub device2_zone: String,
    pub distance_m: f64,
    pub confidence: f64,
    pub score: f64,
    pub threshold: f64,
    pub cluster_distance: f64,
    pub timestamp: DateTime<Utc>,
    pub details: AlertDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertDetails {
    pub pair_anomaly: bool,
    pub device1_anomaly: bool,
    pub device2_anomaly: bool,
    pub device1_reasons: Vec<String>,
    pub device2_reasons: Vec<String>,
    pub device1_zone_typical: bool,
    pub device2_zone_typical: bool,
    pub assigned_cluster: usize,
    pub features: FeatureVector,
}

/// Receives notifications for delivery. Delivery is fire-and-forget.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: &str, notification: Notification);
}

/// Notifier that only logs
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, user_id: &str, notification: Notification) {
        match &notification {
            Notification::AnomalyAlert(alert) => {
                tracing::warn!(
                    user_id,
                    confidence = alert.confidence,
                    "Anomaly: {} in {} / {} in {} ({:.1}m apart, score {:.3} < {:.3})",
                    alert.device1_id,
                    alert.device1_zone,
                    alert.device2_id,
                    alert.device2_zone,
                    alert.distance_m,
                    alert.score,
                    alert.threshold
                );
            }
            Notification::IndividualAnomaly { device_id, reasons, .. } => {
                tracing::warn!(user_id, device_id = %device_id, "Device anomaly: {}", reasons.join("; "));
            }
            Notification::LocationRejected { device_id, reason, .. } => {
                tracing::info!(user_id, device_id = %device_id, "Location rejected: {}", reason);
            }
            other => {
                tracing::debug!(user_id, event = other.name(), "Notification");
            }
        }
    }
}

/// Per-user ordered channels.
///
/// Each user gets one unbounded channel, so notifications for a user are
/// delivered in the order they were published. Publishing to a user with
/// no live subscriber drops the notification.
#[derive(Default)]
pub struct NotificationHub {
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<Notification>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a user's stream, replacing any previous subscriber
    pub fn subscribe(&self, user_id: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(user_id.to_string(), tx);
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Notifier for NotificationHub {
    fn notify(&self, user_id: &str, notification: Notification) {
        let Ok(mut channels) = self.channels.lock() else {
            tracing::error!("Notification hub lock poisoned");
            return;
        };

        let closed = channels
            .get(user_id)
            .map(|tx| tx.send(notification).is_err())
            .unwrap_or(false);

        if closed {
            tracing::debug!(user_id, "Subscriber gone, dropping channel");
            channels.remove(user_id);
        }
    }
}

/// Delivers each notification to every inner notifier, in order
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, user_id: &str, notification: Notification) {
        for target in &self.targets {
            target.notify(user_id, notification.clone());
        }
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Insufficient devices: {found} registered, {required} required")]
    InsufficientDevices { found: usize, required: usize },

    #[error("Insufficient samples: {found} collected, {required} required")]
    InsufficientSamples { found: usize, required: usize },

    #[error("Model unavailable for user: {0}")]
    ModelUnavailable(String),

    #[error("Feature schema mismatch: artifact has v{found}, expected v{expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("Corrupt model artifact: {0}")]
    CorruptArtifact(String),

    #[error("Training failed: {0}")]
    Training(String),
}

impl From<GeoError> for TrackerError {
    fn from(err: GeoError) -> Self {
        TrackerError::InvalidInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(device: &str) -> Notification {
        Notification::LocationRejected {
            device_id: device.to_string(),
            reason: ValidationReason::AccuracyTooLow,
            original_accuracy_m: 80.0,
        }
    }

    #[test]
    fn test_notification_wire_format() {
        let json = serde_json::to_value(rejected("phone")).unwrap();
        assert_eq!(json["event"], "location_rejected");
        assert_eq!(json["reason"], "accuracy_too_low");
        assert_eq!(rejected("phone").name(), "location_rejected");
    }

    #[tokio::test]
    async fn test_hub_preserves_order_per_user() {
        let hub = NotificationHub::new();
        let mut alice = hub.subscribe("alice");
        let mut bob = hub.subscribe("bob");

        for i in 0..5 {
            hub.notify("alice", rejected(&format!("a{}", i)));
        }
        hub.notify("bob", rejected("b0"));
        hub.notify("carol", rejected("c0"));

        for i in 0..5 {
            match alice.recv().await {
                Some(Notification::LocationRejected { device_id, .. }) => {
                    assert_eq!(device_id, format!("a{}", i));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(bob.recv().await, Some(Notification::LocationRejected { .. })));
        assert!(alice.try_recv().is_err());
    }

    #[test]
    fn test_hub_drops_closed_subscribers() {
        let hub = NotificationHub::new();
        let rx = hub.subscribe("alice");
        assert_eq!(hub.subscriber_count(), 1);
        drop(rx);
        hub.notify("alice", rejected("a"));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
