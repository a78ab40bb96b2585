//! Tracker service
//!
//! Drives one incoming fix through validation, zone tagging, pairwise
//! behaviour recording, training and judgement, and emits the resulting
//! notifications on the user's ordered stream.

use crate::judge::{HeuristicJudge, HeuristicPolicy, JudgePanel, PairContext, PanelPolicy, StatisticalJudge};
use crate::model::ModelParams;
use crate::recorder::{summarize_pairs, BehaviorRecorder, PairSummary, PatternSummary};
use crate::store::{ArtifactStore, DocumentStore};
use crate::training::{
    ModelRegistry, SchedulerConfig, StartOutcome, TrainingCheck, TrainingScheduler, TrainingStatusView,
};
use crate::{Notification, Notifier, Result, TrackerError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_geo::{
    DeviceFix, FixValidator, LayoutConfig, Position, RawFix, ValidationReason, ValidatorConfig, ZoneLayout,
};

/// Tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub validator: ValidatorConfig,
    pub layout: LayoutConfig,
    pub scheduler: SchedulerConfig,
    pub model: ModelParams,
    pub heuristics: HeuristicPolicy,
    pub panel_policy: PanelPolicy,
    /// Two fixes further apart in time than this are not compared (seconds)
    pub pair_freshness_seconds: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            validator: ValidatorConfig::default(),
            layout: LayoutConfig::default(),
            scheduler: SchedulerConfig::default(),
            model: ModelParams::default(),
            heuristics: HeuristicPolicy::default(),
            panel_policy: PanelPolicy::default(),
            pair_freshness_seconds: 600,
        }
    }
}

/// What happened to one ingested fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub device_id: String,
    pub accepted: bool,
    pub reason: ValidationReason,
    pub position: Option<Position>,
    pub accuracy_m: Option<f64>,
    pub drift_m: Option<f64>,
    pub zone_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Pairwise records written for this fix
    pub pairs_recorded: usize,
    /// Anomaly notifications raised for this fix
    pub anomalies: usize,
}

/// Tracker service
pub struct Tracker {
    config: TrackerConfig,
    validator: FixValidator,
    store: Arc<dyn DocumentStore>,
    recorder: BehaviorRecorder,
    scheduler: TrainingScheduler,
    heuristic: Arc<HeuristicJudge>,
    notifier: Arc<dyn Notifier>,
}

impl Tracker {
    pub fn new(
        config: TrackerConfig,
        store: Arc<dyn DocumentStore>,
        artifacts: Arc<dyn ArtifactStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let scheduler = TrainingScheduler::new(
            config.scheduler.clone(),
            config.model.clone(),
            store.clone(),
            artifacts,
            Arc::new(ModelRegistry::new()),
            notifier.clone(),
        );

        Self {
            validator: FixValidator::new(config.validator.clone()),
            recorder: BehaviorRecorder::new(store.clone()),
            heuristic: Arc::new(HeuristicJudge::new(config.heuristics.clone())),
            config,
            store,
            scheduler,
            notifier,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Register a device; returns the user's device count
    pub fn register_device(&self, user_id: &str, device_id: &str, now: DateTime<Utc>) -> Result<usize> {
        if user_id.is_empty() || device_id.is_empty() {
            return Err(TrackerError::InvalidInput("user and device ids must not be empty".to_string()));
        }

        let count = self.store.register_device(user_id, device_id)?;
        tracing::info!(user_id, device_id, "Registered device ({} total)", count);

        self.scheduler.on_device_registered(user_id, count, now)?;
        Ok(count)
    }

    /// Ingest one GPS fix
    pub async fn ingest_fix(
        &self,
        user_id: &str,
        device_id: &str,
        lat: f64,
        lon: f64,
        accuracy_m: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<ValidationOutcome> {
        let raw = RawFix::new(device_id, lat, lon, accuracy_m, timestamp)?;

        let devices = self.store.devices(user_id)?;
        if !devices.iter().any(|d| d == device_id) {
            return Err(TrackerError::InvalidInput(format!(
                "device {} is not registered to user {}",
                device_id, user_id
            )));
        }

        let previous = self.store.current_fix(user_id, device_id)?;
        let anchor = previous.as_ref().and_then(|p| p.anchor.as_ref());
        let validation = self.validator.validate(anchor, &raw);

        let mut outcome = ValidationOutcome {
            device_id: device_id.to_string(),
            accepted: validation.is_accepted(),
            reason: validation.reason,
            position: validation.position,
            accuracy_m: validation.accuracy_m,
            drift_m: validation.drift_m,
            zone_name: None,
            timestamp,
            pairs_recorded: 0,
            anomalies: 0,
        };

        let Some(position) = validation.position else {
            self.notifier.notify(
                user_id,
                Notification::LocationRejected {
                    device_id: device_id.to_string(),
                    reason: validation.reason,
                    original_accuracy_m: accuracy_m,
                },
            );
            return Ok(outcome);
        };

        let layout = self.layout_or_create(user_id, position)?;
        let zone_name = layout.classify(position.lat, position.lon).to_string();

        let fix = DeviceFix::from_validation(&raw, &validation, previous.as_ref(), &zone_name)
            .ok_or_else(|| TrackerError::InvalidInput("accepted fix without a position".to_string()))?;
        self.store.upsert_fix(user_id, &fix)?;

        self.notifier.notify(
            user_id,
            Notification::LocationUpdate {
                device_id: device_id.to_string(),
                position: fix.position,
                accuracy_m: fix.accuracy_m,
                timestamp: fix.timestamp,
                validation_reason: fix.validation_reason,
                zone_name: zone_name.clone(),
            },
        );
        outcome.zone_name = Some(zone_name);

        // Compare against every other device with a fresh fix, keeping
        // registration order within each pair
        let freshness_ms = self.config.pair_freshness_seconds.saturating_mul(1000);
        let own_index = devices.iter().position(|d| d == device_id).unwrap_or(0);

        for (index, other_id) in devices.iter().enumerate() {
            if other_id == device_id {
                continue;
            }
            let Some(other) = self.store.current_fix(user_id, other_id)? else {
                continue;
            };
            if (fix.timestamp - other.timestamp).num_milliseconds().abs() > freshness_ms {
                tracing::debug!(user_id, "Skipping stale pair {} / {}", device_id, other_id);
                continue;
            }

            let (first, second) = if own_index < index { (&fix, &other) } else { (&other, &fix) };
            outcome.anomalies += self.analyze_pair(user_id, first, second, &layout).await?;
            outcome.pairs_recorded += 1;
        }

        Ok(outcome)
    }

    async fn analyze_pair(&self, user_id: &str, fix1: &DeviceFix, fix2: &DeviceFix, layout: &ZoneLayout) -> Result<usize> {
        let record = self.recorder.record_pair(user_id, fix1, fix2, layout)?;

        let mut panel = JudgePanel::new(self.config.panel_policy);
        if let TrainingCheck::Ready(model) = self.scheduler.check_and_train(user_id, record.timestamp).await? {
            panel = panel.with_judge(Arc::new(StatisticalJudge::new(model)));
        }
        panel = panel.with_judge(self.heuristic.clone());

        let typical = |device_id: &str, zone_id| -> Result<bool> {
            Ok(self
                .store
                .pattern(user_id, device_id)?
                .map(|p| p.is_typical(zone_id))
                .unwrap_or(false))
        };

        let context = PairContext {
            device1_zone: layout.zone_name(record.zone1_id).to_string(),
            device2_zone: layout.zone_name(record.zone2_id).to_string(),
            device1_zone_typical: typical(&record.device1_id, record.zone1_id)?,
            device2_zone_typical: typical(&record.device2_id, record.zone2_id)?,
        };

        let notifications = panel.decide(&record, &context);
        let count = notifications.len();
        for notification in notifications {
            self.notifier.notify(user_id, notification);
        }

        Ok(count)
    }

    fn layout_or_create(&self, user_id: &str, center: Position) -> Result<ZoneLayout> {
        if let Some(layout) = self.store.layout(user_id)? {
            return Ok(layout);
        }

        let layout = ZoneLayout::generate(center, &self.config.layout)?;
        tracing::info!(
            user_id,
            "Created campus layout at ({:.6}, {:.6}), {:.0}m across",
            center.lat,
            center.lon,
            layout.total_size_m()
        );
        self.store.insert_layout_if_absent(user_id, layout)
    }

    pub fn layout(&self, user_id: &str) -> Result<Option<ZoneLayout>> {
        self.store.layout(user_id)
    }

    pub fn get_training_status(&self, user_id: &str, now: DateTime<Utc>) -> Result<TrainingStatusView> {
        self.scheduler.status(user_id, now)
    }

    pub fn request_training_start(&self, user_id: &str, now: DateTime<Utc>) -> Result<StartOutcome> {
        self.scheduler.request_start(user_id, now)
    }

    pub fn get_device_patterns(&self, user_id: &str) -> Result<Vec<PatternSummary>> {
        Ok(self
            .store
            .patterns(user_id)?
            .iter()
            .map(PatternSummary::from)
            .collect())
    }

    /// Per-pair aggregates over the last `minutes`
    pub fn recent_behavior_summary(&self, user_id: &str, minutes: i64, now: DateTime<Utc>) -> Result<Vec<PairSummary>> {
        let records = self.store.behavior_since(user_id, now - Duration::minutes(minutes))?;
        Ok(summarize_pairs(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryArtifactStore, MemoryStore};
    use crate::testing::{t0, CaptureNotifier};
    use crate::training::TrainingPhase;
    use tandem_geo::OUTSIDE_ZONE;

    fn tracker() -> (Tracker, Arc<MemoryStore>, Arc<CaptureNotifier>) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(CaptureNotifier::default());
        let tracker = Tracker::new(
            TrackerConfig::default(),
            store.clone(),
            Arc::new(MemoryArtifactStore::new()),
            notifier.clone(),
        );
        (tracker, store, notifier)
    }

    #[tokio::test]
    async fn test_rejects_unregistered_device() {
        let (tracker, store, _) = tracker();
        let err = tracker.ingest_fix("u", "ghost", 10.0, 10.0, 2.0, t0()).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidInput(_)));
        assert!(store.current_fix("u", "ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_malformed_input_without_side_effects() {
        let (tracker, store, notifier) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();
        notifier.take();

        let err = tracker.ingest_fix("u", "phone", f64::NAN, 10.0, 2.0, t0()).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidInput(_)));
        assert!(store.current_fix("u", "phone").unwrap().is_none());
        assert!(store.layout("u").unwrap().is_none());
        assert!(notifier.names().is_empty());
    }

    #[tokio::test]
    async fn test_low_accuracy_is_a_policy_rejection() {
        let (tracker, store, notifier) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();

        let outcome = tracker.ingest_fix("u", "phone", 10.0, 10.0, 80.0, t0()).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, ValidationReason::AccuracyTooLow);
        assert!(store.current_fix("u", "phone").unwrap().is_none());

        match notifier.take().last() {
            Some(Notification::LocationRejected { original_accuracy_m, .. }) => {
                assert_eq!(*original_accuracy_m, 80.0)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_fix_creates_layout() {
        let (tracker, _, _) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();

        let outcome = tracker.ingest_fix("u", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap();
        assert_eq!(outcome.zone_name.as_deref(), Some("Canteen"));

        let layout = tracker.layout("u").unwrap().unwrap();
        assert_eq!(layout.center, Position::new(10.0, 10.0));

        // A later fix elsewhere keeps the original layout
        tracker.ingest_fix("u", "phone", 10.5, 10.5, 2.0, t0()).await.unwrap();
        assert_eq!(tracker.layout("u").unwrap().unwrap().center, Position::new(10.0, 10.0));
        let fix = tracker.store.current_fix("u", "phone").unwrap().unwrap();
        assert_eq!(fix.zone_name, OUTSIDE_ZONE);
    }

    #[tokio::test]
    async fn test_second_device_starts_collection_and_pairs() {
        let (tracker, store, notifier) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();
        assert_eq!(tracker.register_device("u", "laptop", t0()).unwrap(), 2);
        assert_eq!(
            store.training_state("u").unwrap().unwrap().phase,
            TrainingPhase::Collecting
        );

        tracker.ingest_fix("u", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap();
        let outcome = tracker
            .ingest_fix("u", "laptop", 10.00001, 10.0, 2.0, t0() + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(outcome.pairs_recorded, 1);

        let records = store.recent_behavior("u", 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device1_id, "phone");
        assert_eq!(records[0].device2_id, "laptop");
        assert!(records[0].same_zone);

        let names = notifier.names();
        assert!(names.contains(&"ml_training_progress"));
    }

    #[tokio::test]
    async fn test_stale_companion_is_not_paired() {
        let (tracker, store, _) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();
        tracker.register_device("u", "laptop", t0()).unwrap();

        tracker.ingest_fix("u", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap();
        let outcome = tracker
            .ingest_fix("u", "laptop", 10.0, 10.0, 2.0, t0() + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(outcome.pairs_recorded, 0);
        assert_eq!(store.behavior_count("u").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_union_policy_reports_heuristics_before_training() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(CaptureNotifier::default());
        let tracker = Tracker::new(
            TrackerConfig {
                panel_policy: PanelPolicy::Union,
                ..TrackerConfig::default()
            },
            store.clone(),
            Arc::new(MemoryArtifactStore::new()),
            notifier.clone(),
        );
        tracker.register_device("u", "phone", t0()).unwrap();
        tracker.register_device("u", "laptop", t0()).unwrap();

        tracker.ingest_fix("u", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap();
        let outcome = tracker
            .ingest_fix("u", "laptop", 10.01, 10.0, 2.0, t0() + Duration::seconds(1))
            .await
            .unwrap();

        // Each side sees the other leave campus
        assert_eq!(outcome.anomalies, 2);
        let seen = notifier.take();
        let devices: Vec<&str> = seen
            .iter()
            .filter_map(|n| match n {
                Notification::IndividualAnomaly { device_id, .. } => Some(device_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(devices, ["phone", "laptop"]);
    }

    #[tokio::test]
    async fn test_recent_summary_and_patterns() {
        let (tracker, _, _) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();
        tracker.register_device("u", "laptop", t0()).unwrap();

        for i in 0..4 {
            let at = t0() + Duration::seconds(10 * i);
            tracker.ingest_fix("u", "phone", 10.0, 10.0, 2.0, at).await.unwrap();
            tracker.ingest_fix("u", "laptop", 10.0, 10.0, 2.0, at).await.unwrap();
        }

        let summary = tracker.recent_behavior_summary("u", 5, t0() + Duration::minutes(1)).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].total_samples, 7);
        assert_eq!(summary[0].same_zone_count, 7);

        let patterns = tracker.get_device_patterns("u").unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].device_id, "phone");
        assert_eq!(patterns[0].typical_zones, vec![4]);
        assert_eq!(patterns[0].companion_device_ids, vec!["laptop".to_string()]);
    }

    #[tokio::test]
    async fn test_speed_uses_each_devices_own_fix_time() {
        let (tracker, store, _) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();
        tracker.register_device("u", "laptop", t0()).unwrap();

        tracker.ingest_fix("u", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap();
        tracker.ingest_fix("u", "laptop", 10.0, 10.0, 2.0, t0()).await.unwrap();
        // Phone re-reports in place while the laptop's fix is still from t0
        tracker
            .ingest_fix("u", "phone", 10.0, 10.0, 2.0, t0() + Duration::seconds(10))
            .await
            .unwrap();

        let walked = tandem_geo::math::offset(Position::new(10.0, 10.0), 0.0, 20.0);
        tracker
            .ingest_fix("u", "laptop", walked.lat, walked.lon, 2.0, t0() + Duration::seconds(11))
            .await
            .unwrap();

        let records = store.recent_behavior("u", 10).unwrap();
        assert_eq!(records.len(), 3);
        let last = records.iter().max_by_key(|r| r.timestamp).unwrap();
        assert_eq!(last.device1_timestamp, t0() + Duration::seconds(10));
        assert_eq!(last.device2_timestamp, t0() + Duration::seconds(11));
        assert_eq!(last.speed1_mps, 0.0);
        // 20 m over the 11 s since the laptop's previous fix
        assert!((last.speed2_mps - 20.0 / 11.0).abs() < 0.01, "speed {}", last.speed2_mps);
        assert!(!last.moving_together);
    }

    #[tokio::test]
    async fn test_storage_outage_propagates() {
        let (tracker, store, _) = tracker();
        tracker.register_device("u", "phone", t0()).unwrap();
        store.set_offline(true);

        let err = tracker.ingest_fix("u", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap_err();
        assert!(matches!(err, TrackerError::StorageUnavailable(_)));
    }
}
