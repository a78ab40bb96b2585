//! Training scheduling
//!
//! Per-user state machine `idle → collecting → trained`. While collecting,
//! every behaviour event re-counts the stored records and fits a model once
//! enough samples exist or the collection window has elapsed. Fits are
//! single-flight per user and run on the blocking pool.

use crate::model::{AnomalyModel, ModelInfo, ModelParams};
use crate::store::{ArtifactStore, DocumentStore};
use crate::{Notification, Notifier, Result, TrackerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Devices a user needs before training can start
pub const MIN_DEVICES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    Idle,
    Collecting,
    Trained,
}

impl TrainingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingPhase::Idle => "idle",
            TrainingPhase::Collecting => "collecting",
            TrainingPhase::Trained => "trained",
        }
    }
}

/// Persisted per-user training state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub user_id: String,
    pub phase: TrainingPhase,
    pub training_started_at: Option<DateTime<Utc>>,
    pub training_completed_at: Option<DateTime<Utc>>,
    pub sample_count: usize,
    pub model_artifact_ref: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// Scheduler thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub min_training_samples: usize,
    pub training_window_minutes: f64,
    /// Most recent records read per check
    pub behavior_read_limit: usize,
    /// Smallest sample a window-triggered fit accepts
    pub min_window_samples: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_training_samples: 30,
            training_window_minutes: 5.0,
            behavior_read_limit: 200,
            min_window_samples: 10,
        }
    }
}

/// Result of one check-and-maybe-train pass
#[derive(Debug, Clone)]
pub enum TrainingCheck {
    /// A model is available for scoring
    Ready(Arc<AnomalyModel>),
    /// A collection cycle was just started
    Started,
    Collecting { sample_count: usize, elapsed_minutes: f64 },
    InsufficientDevices { device_count: usize },
    /// Another fit for this user is running
    InFlight,
}

/// Result of an explicit start request
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(TrainingState),
    AlreadyInProgress,
    InsufficientDevices { device_count: usize },
}

/// Caller-facing status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatusView {
    pub user_id: String,
    pub phase: TrainingPhase,
    pub is_training: bool,
    pub is_trained: bool,
    pub device_count: usize,
    pub sample_count: usize,
    pub target_samples: usize,
    pub training_started_at: Option<DateTime<Utc>>,
    pub training_completed_at: Option<DateTime<Utc>>,
    pub elapsed_minutes: Option<f64>,
    pub remaining_minutes: Option<f64>,
    pub progress_percentage: Option<f64>,
    pub model_info: Option<ModelInfo>,
    pub message: String,
}

#[derive(Default)]
struct ModelSlot {
    model: Mutex<Option<Arc<AnomalyModel>>>,
    training: AtomicBool,
}

impl ModelSlot {
    fn model(&self) -> MutexGuard<'_, Option<Arc<AnomalyModel>>> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the slot's training flag when dropped
pub struct TrainingGuard {
    slot: Arc<ModelSlot>,
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        self.slot.training.store(false, Ordering::SeqCst);
    }
}

/// Live models keyed by user.
///
/// Each user has one slot; reads and writes of a user's model go through
/// that slot's lock, and the slot's flag admits one fit at a time.
#[derive(Default)]
pub struct ModelRegistry {
    slots: Mutex<HashMap<String, Arc<ModelSlot>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, user_id: &str) -> Arc<ModelSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(user_id.to_string()).or_default().clone()
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<AnomalyModel>> {
        self.slot(user_id).model().clone()
    }

    pub fn insert(&self, user_id: &str, model: Arc<AnomalyModel>) {
        *self.slot(user_id).model() = Some(model);
    }

    pub fn remove(&self, user_id: &str) -> Option<Arc<AnomalyModel>> {
        self.slot(user_id).model().take()
    }

    /// Claim the user's training flag, or `None` when a fit is already running
    pub fn try_begin_training(&self, user_id: &str) -> Option<TrainingGuard> {
        let slot = self.slot(user_id);
        slot.training
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TrainingGuard { slot })
    }

    pub fn is_training(&self, user_id: &str) -> bool {
        self.slot(user_id).training.load(Ordering::SeqCst)
    }
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Training scheduler
pub struct TrainingScheduler {
    config: SchedulerConfig,
    params: ModelParams,
    store: Arc<dyn DocumentStore>,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<ModelRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl TrainingScheduler {
    pub fn new(
        config: SchedulerConfig,
        params: ModelParams,
        store: Arc<dyn DocumentStore>,
        artifacts: Arc<dyn ArtifactStore>,
        registry: Arc<ModelRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            params,
            store,
            artifacts,
            registry,
            notifier,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Enter `collecting` with a fresh window
    pub fn start_collection(&self, user_id: &str, now: DateTime<Utc>) -> Result<TrainingState> {
        let state = TrainingState {
            user_id: user_id.to_string(),
            phase: TrainingPhase::Collecting,
            training_started_at: Some(now),
            training_completed_at: None,
            sample_count: 0,
            model_artifact_ref: None,
            last_update: now,
        };
        self.store.upsert_training_state(&state)?;
        self.registry.remove(user_id);

        tracing::info!(user_id, "Started ML training collection");

        self.notifier.notify(
            user_id,
            Notification::MlStatusUpdate {
                phase: TrainingPhase::Collecting,
                is_training: true,
                is_trained: false,
                sample_count: 0,
                message: "ML training started. Collecting behavior data...".to_string(),
            },
        );

        Ok(state)
    }

    /// Start collecting once a second device appears and nothing is recorded yet
    pub fn on_device_registered(&self, user_id: &str, device_count: usize, now: DateTime<Utc>) -> Result<Option<TrainingState>> {
        if device_count < MIN_DEVICES || self.store.training_state(user_id)?.is_some() {
            return Ok(None);
        }
        self.start_collection(user_id, now).map(Some)
    }

    /// Explicit start request
    pub fn request_start(&self, user_id: &str, now: DateTime<Utc>) -> Result<StartOutcome> {
        let device_count = self.store.devices(user_id)?.len();
        if device_count < MIN_DEVICES {
            return Ok(StartOutcome::InsufficientDevices { device_count });
        }

        let phase = self.store.training_state(user_id)?.map(|s| s.phase);
        if matches!(phase, Some(TrainingPhase::Collecting) | Some(TrainingPhase::Trained)) {
            return Ok(StartOutcome::AlreadyInProgress);
        }

        self.start_collection(user_id, now).map(StartOutcome::Started)
    }

    /// Check the user's state and fit a model when a trigger fires.
    ///
    /// Idempotent under concurrent calls: only one fit per user runs, other
    /// callers see [`TrainingCheck::InFlight`].
    pub async fn check_and_train(&self, user_id: &str, now: DateTime<Utc>) -> Result<TrainingCheck> {
        let state = self.store.training_state(user_id)?;

        if let Some(state) = state.as_ref().filter(|s| s.phase == TrainingPhase::Trained) {
            if let Some(model) = self.load_model(user_id)? {
                return Ok(TrainingCheck::Ready(model));
            }
            tracing::warn!(
                user_id,
                samples = state.sample_count,
                "Trained model unavailable, restarting collection"
            );
            self.start_collection(user_id, now)?;
            return Ok(TrainingCheck::Started);
        }

        let device_count = self.store.devices(user_id)?.len();
        if device_count < MIN_DEVICES {
            tracing::debug!(user_id, "Training paused: {} device(s) registered", device_count);
            return Ok(TrainingCheck::InsufficientDevices { device_count });
        }

        if !matches!(state.map(|s| s.phase), Some(TrainingPhase::Collecting)) {
            self.start_collection(user_id, now)?;
            return Ok(TrainingCheck::Started);
        }

        let Some(guard) = self.registry.try_begin_training(user_id) else {
            return Ok(TrainingCheck::InFlight);
        };
        self.collect_or_train(guard, user_id, now).await
    }

    /// Progress or fit for a collecting user, run while holding the guard.
    ///
    /// State is read again under the guard: a fit that completed after the
    /// caller's first read is handed back rather than repeated.
    async fn collect_or_train(&self, _guard: TrainingGuard, user_id: &str, now: DateTime<Utc>) -> Result<TrainingCheck> {
        let state = match self.store.training_state(user_id)? {
            Some(s) if s.phase == TrainingPhase::Collecting => s,
            Some(s) if s.phase == TrainingPhase::Trained => {
                tracing::debug!(user_id, "Model trained by a concurrent check");
                return Ok(match self.load_model(user_id)? {
                    Some(model) => TrainingCheck::Ready(model),
                    None => TrainingCheck::InFlight,
                });
            }
            _ => return Ok(TrainingCheck::InFlight),
        };

        let started_at = state.training_started_at.unwrap_or(now);
        let elapsed_minutes = minutes_between(started_at, now).max(0.0);

        let records = self.store.recent_behavior(user_id, self.config.behavior_read_limit)?;
        let sample_count = records.len();

        self.store.upsert_training_state(&TrainingState {
            sample_count,
            last_update: now,
            ..state.clone()
        })?;

        self.notifier.notify(
            user_id,
            Notification::MlTrainingProgress {
                samples: sample_count,
                target_samples: self.config.min_training_samples,
                elapsed_minutes,
                target_minutes: self.config.training_window_minutes,
                message: format!(
                    "Collecting behavior patterns: {}/{} samples",
                    sample_count, self.config.min_training_samples
                ),
            },
        );

        let count_ready = sample_count >= self.config.min_training_samples;
        let window_ready = elapsed_minutes >= self.config.training_window_minutes
            && sample_count >= self.config.min_window_samples;

        if !count_ready && !window_ready {
            tracing::debug!(
                user_id,
                samples = sample_count,
                "Collecting: {}/{} samples, {:.1} min elapsed",
                sample_count,
                self.config.min_training_samples,
                elapsed_minutes
            );
            return Ok(TrainingCheck::Collecting {
                sample_count,
                elapsed_minutes,
            });
        }

        let params = ModelParams {
            min_samples: if count_ready {
                self.config.min_training_samples
            } else {
                self.config.min_window_samples
            },
            ..self.params.clone()
        };
        let patterns = self.store.patterns(user_id)?;

        tracing::info!(user_id, samples = sample_count, "Training ML model");

        let owner = user_id.to_string();
        let fit = tokio::task::spawn_blocking(move || {
            let mut model = AnomalyModel::train(&owner, &records, &params, Some(started_at), now)?;
            model.adopt_patterns(&patterns);
            Ok::<_, TrackerError>(model)
        })
        .await
        .map_err(|e| TrackerError::Training(e.to_string()))
        .and_then(|r| r);

        let model = match fit {
            Ok(model) => Arc::new(model),
            Err(e) => {
                tracing::warn!(user_id, "ML training failed: {}", e);
                return Ok(TrainingCheck::Collecting {
                    sample_count,
                    elapsed_minutes,
                });
            }
        };

        self.artifacts.write(user_id, &model.to_bytes()?)?;
        self.registry.insert(user_id, model.clone());

        self.store.upsert_training_state(&TrainingState {
            user_id: user_id.to_string(),
            phase: TrainingPhase::Trained,
            training_started_at: Some(started_at),
            training_completed_at: Some(now),
            sample_count,
            model_artifact_ref: Some(user_id.to_string()),
            last_update: now,
        })?;

        tracing::info!(user_id, samples = sample_count, "ML model trained");

        self.notifier.notify(
            user_id,
            Notification::MlTrainingComplete {
                message: "Security system activated!".to_string(),
                samples: sample_count,
                model_info: model.info(),
            },
        );

        Ok(TrainingCheck::Ready(model))
    }

    /// Live model, loading the persisted artifact on a registry miss.
    ///
    /// Missing, corrupt or schema-mismatched artifacts read as `None`.
    fn load_model(&self, user_id: &str) -> Result<Option<Arc<AnomalyModel>>> {
        if let Some(model) = self.registry.get(user_id) {
            return Ok(Some(model));
        }

        let Some(bytes) = self.artifacts.read(user_id)? else {
            return Ok(None);
        };

        match AnomalyModel::from_bytes(&bytes) {
            Ok(model) => {
                let model = Arc::new(model);
                self.registry.insert(user_id, model.clone());
                tracing::info!(user_id, "Loaded trained model");
                Ok(Some(model))
            }
            Err(e) => {
                tracing::warn!(user_id, "Ignoring model artifact: {}", e);
                Ok(None)
            }
        }
    }

    pub fn status(&self, user_id: &str, now: DateTime<Utc>) -> Result<TrainingStatusView> {
        let device_count = self.store.devices(user_id)?.len();
        let state = self.store.training_state(user_id)?;
        let target_samples = self.config.min_training_samples;

        let Some(state) = state.filter(|s| s.phase != TrainingPhase::Idle) else {
            let message = if device_count >= MIN_DEVICES {
                "Ready to start ML training".to_string()
            } else {
                format!("Add {} more device(s) to start ML training", MIN_DEVICES - device_count)
            };
            return Ok(TrainingStatusView {
                user_id: user_id.to_string(),
                phase: TrainingPhase::Idle,
                is_training: false,
                is_trained: false,
                device_count,
                sample_count: 0,
                target_samples,
                training_started_at: None,
                training_completed_at: None,
                elapsed_minutes: None,
                remaining_minutes: None,
                progress_percentage: None,
                model_info: None,
                message,
            });
        };

        let mut view = TrainingStatusView {
            user_id: user_id.to_string(),
            phase: state.phase,
            is_training: state.phase == TrainingPhase::Collecting,
            is_trained: state.phase == TrainingPhase::Trained,
            device_count,
            sample_count: state.sample_count,
            target_samples,
            training_started_at: state.training_started_at,
            training_completed_at: state.training_completed_at,
            elapsed_minutes: None,
            remaining_minutes: None,
            progress_percentage: None,
            model_info: None,
            message: String::new(),
        };

        match state.phase {
            TrainingPhase::Collecting => {
                let window = self.config.training_window_minutes;
                let elapsed = state
                    .training_started_at
                    .map(|t| minutes_between(t, now).max(0.0))
                    .unwrap_or(0.0);
                let remaining = (window - elapsed).max(0.0);
                let progress = if window > 0.0 { (elapsed / window * 100.0).min(100.0) } else { 100.0 };

                view.elapsed_minutes = Some(round1(elapsed));
                view.remaining_minutes = Some(round1(remaining));
                view.progress_percentage = Some(progress.floor());
                view.message = format!(
                    "Learning behavior patterns: {}/{} samples, {:.1} min remaining",
                    state.sample_count, target_samples, remaining
                );
            }
            TrainingPhase::Trained => {
                view.model_info = self.load_model(user_id)?.map(|m| m.info());
                view.message = "Security system active".to_string();
            }
            TrainingPhase::Idle => {}
        }

        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryArtifactStore, MemoryStore};
    use crate::testing::{normal_records, t0, CaptureNotifier};
    use chrono::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        artifacts: Arc<MemoryArtifactStore>,
        notifier: Arc<CaptureNotifier>,
        scheduler: TrainingScheduler,
    }

    fn harness(devices: &[&str]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let notifier = Arc::new(CaptureNotifier::default());
        for d in devices {
            store.register_device("u", d).unwrap();
        }

        let scheduler = TrainingScheduler::new(
            SchedulerConfig::default(),
            ModelParams {
                num_trees: 50,
                ..ModelParams::default()
            },
            store.clone(),
            artifacts.clone(),
            Arc::new(ModelRegistry::new()),
            notifier.clone(),
        );

        Harness {
            store,
            artifacts,
            notifier,
            scheduler,
        }
    }

    fn add_records(h: &Harness, n: usize) {
        for r in normal_records("u", n, t0(), 11) {
            h.store.append_behavior(&r).unwrap();
        }
    }

    fn phase(h: &Harness) -> TrainingPhase {
        h.store.training_state("u").unwrap().unwrap().phase
    }

    #[tokio::test]
    async fn test_needs_two_devices() {
        let h = harness(&["phone"]);
        let check = h.scheduler.check_and_train("u", t0()).await.unwrap();
        assert!(matches!(check, TrainingCheck::InsufficientDevices { device_count: 1 }));
        assert!(h.store.training_state("u").unwrap().is_none());

        let status = h.scheduler.status("u", t0()).unwrap();
        assert_eq!(status.message, "Add 1 more device(s) to start ML training");
    }

    #[tokio::test]
    async fn test_first_check_starts_collection() {
        let h = harness(&["phone", "laptop"]);
        let check = h.scheduler.check_and_train("u", t0()).await.unwrap();
        assert!(matches!(check, TrainingCheck::Started));
        assert_eq!(phase(&h), TrainingPhase::Collecting);
        assert_eq!(h.notifier.names(), vec!["ml_status_update"]);
    }

    #[tokio::test]
    async fn test_29_records_keep_collecting() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 29);

        let check = h.scheduler.check_and_train("u", t0() + Duration::minutes(4)).await.unwrap();
        match check {
            TrainingCheck::Collecting { sample_count, elapsed_minutes } => {
                assert_eq!(sample_count, 29);
                assert!((elapsed_minutes - 4.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(phase(&h), TrainingPhase::Collecting);
        assert_eq!(h.store.training_state("u").unwrap().unwrap().sample_count, 29);
        assert!(h.artifacts.read("u").unwrap().is_none());
        assert_eq!(h.notifier.names().last(), Some(&"ml_training_progress"));
    }

    #[tokio::test]
    async fn test_30_records_train() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 30);

        let now = t0() + Duration::seconds(30);
        let check = h.scheduler.check_and_train("u", now).await.unwrap();
        let TrainingCheck::Ready(model) = check else {
            panic!("expected a trained model");
        };
        assert_eq!(model.sample_count, 30);

        let state = h.store.training_state("u").unwrap().unwrap();
        assert_eq!(state.phase, TrainingPhase::Trained);
        assert_eq!(state.training_completed_at, Some(now));
        assert_eq!(state.training_started_at, Some(t0()));
        assert_eq!(state.sample_count, 30);

        let bytes = h.artifacts.read("u").unwrap().unwrap();
        assert_eq!(AnomalyModel::from_bytes(&bytes).unwrap().sample_count, 30);

        let names = h.notifier.names();
        assert_eq!(&names[names.len() - 2..], ["ml_training_progress", "ml_training_complete"]);
    }

    #[tokio::test]
    async fn test_29_records_after_window_train() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 29);

        let check = h.scheduler.check_and_train("u", t0() + Duration::minutes(5)).await.unwrap();
        assert!(matches!(check, TrainingCheck::Ready(_)));
        assert_eq!(phase(&h), TrainingPhase::Trained);
    }

    #[tokio::test]
    async fn test_window_needs_a_floor_of_samples() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 5);

        let check = h.scheduler.check_and_train("u", t0() + Duration::minutes(30)).await.unwrap();
        assert!(matches!(check, TrainingCheck::Collecting { sample_count: 5, .. }));
        assert_eq!(phase(&h), TrainingPhase::Collecting);
    }

    #[tokio::test]
    async fn test_trained_reloads_from_artifact() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 30);
        h.scheduler.check_and_train("u", t0()).await.unwrap();

        // Fresh process: empty registry
        h.scheduler.registry().remove("u");
        let check = h.scheduler.check_and_train("u", t0() + Duration::hours(1)).await.unwrap();
        assert!(matches!(check, TrainingCheck::Ready(_)));
        assert!(h.scheduler.registry().get("u").is_some());
    }

    #[tokio::test]
    async fn test_missing_artifact_restarts_collection() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 30);
        h.scheduler.check_and_train("u", t0()).await.unwrap();

        h.scheduler.registry().remove("u");
        h.artifacts.write("u", b"garbage").unwrap();

        let later = t0() + Duration::hours(2);
        let check = h.scheduler.check_and_train("u", later).await.unwrap();
        assert!(matches!(check, TrainingCheck::Started));

        let state = h.store.training_state("u").unwrap().unwrap();
        assert_eq!(state.phase, TrainingPhase::Collecting);
        assert_eq!(state.training_started_at, Some(later));
        assert_eq!(state.sample_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_checks_fit_once() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 40);

        let (a, b) = tokio::join!(
            h.scheduler.check_and_train("u", t0()),
            h.scheduler.check_and_train("u", t0())
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let ready = outcomes.iter().filter(|c| matches!(c, TrainingCheck::Ready(_))).count();
        let in_flight = outcomes.iter().filter(|c| matches!(c, TrainingCheck::InFlight)).count();
        assert_eq!((ready, in_flight), (1, 1));
        assert_eq!(h.notifier.names().iter().filter(|n| **n == "ml_training_complete").count(), 1);
        assert!(!h.scheduler.registry().is_training("u"));
    }

    #[tokio::test]
    async fn test_check_that_lost_the_race_does_not_retrain() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 30);

        let TrainingCheck::Ready(first) = h.scheduler.check_and_train("u", t0()).await.unwrap() else {
            panic!("expected a trained model");
        };

        // A caller that read `collecting` before the fit finished and only
        // now gets the guard
        let guard = h.scheduler.registry().try_begin_training("u").unwrap();
        let later = t0() + Duration::minutes(1);
        let check = h.scheduler.collect_or_train(guard, "u", later).await.unwrap();

        let TrainingCheck::Ready(model) = check else {
            panic!("expected the existing model");
        };
        assert!(Arc::ptr_eq(&model, &first));
        assert_eq!(h.notifier.names().iter().filter(|n| **n == "ml_training_complete").count(), 1);
        assert_eq!(h.store.training_state("u").unwrap().unwrap().training_completed_at, Some(t0()));
        assert!(!h.scheduler.registry().is_training("u"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_checks_fit_once() {
        let h = Arc::new(harness(&["phone", "laptop"]));
        h.scheduler.start_collection("u", t0()).unwrap();
        add_records(&h, 40);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let h = h.clone();
                tokio::spawn(async move {
                    h.scheduler.check_and_train("u", t0() + Duration::seconds(i)).await
                })
            })
            .collect();

        for task in tasks {
            let check = task.await.unwrap().unwrap();
            assert!(matches!(check, TrainingCheck::Ready(_) | TrainingCheck::InFlight));
        }
        assert_eq!(h.notifier.names().iter().filter(|n| **n == "ml_training_complete").count(), 1);
        assert_eq!(phase(&h), TrainingPhase::Trained);
    }

    #[test]
    fn test_guard_releases_flag() {
        let registry = ModelRegistry::new();
        let guard = registry.try_begin_training("u").unwrap();
        assert!(registry.try_begin_training("u").is_none());
        assert!(registry.try_begin_training("other").is_some());
        drop(guard);
        assert!(registry.try_begin_training("u").is_some());
    }

    #[test]
    fn test_request_start() {
        let h = harness(&["phone"]);
        assert_eq!(
            h.scheduler.request_start("u", t0()).unwrap(),
            StartOutcome::InsufficientDevices { device_count: 1 }
        );

        h.store.register_device("u", "laptop").unwrap();
        assert!(matches!(h.scheduler.request_start("u", t0()).unwrap(), StartOutcome::Started(_)));
        assert_eq!(h.scheduler.request_start("u", t0()).unwrap(), StartOutcome::AlreadyInProgress);
    }

    #[test]
    fn test_on_device_registered_starts_once() {
        let h = harness(&["phone", "laptop"]);
        assert!(h.scheduler.on_device_registered("u", 1, t0()).unwrap().is_none());
        assert!(h.scheduler.on_device_registered("u", 2, t0()).unwrap().is_some());
        assert!(h.scheduler.on_device_registered("u", 3, t0()).unwrap().is_none());
    }

    #[test]
    fn test_collecting_status_view() {
        let h = harness(&["phone", "laptop"]);
        h.scheduler.start_collection("u", t0()).unwrap();

        let status = h.scheduler.status("u", t0() + Duration::seconds(90)).unwrap();
        assert!(status.is_training);
        assert!(!status.is_trained);
        assert_eq!(status.elapsed_minutes, Some(1.5));
        assert_eq!(status.remaining_minutes, Some(3.5));
        assert_eq!(status.progress_percentage, Some(30.0));
        assert!(status.message.starts_with("Learning behavior patterns: 0/30"));
    }

    #[test]
    fn test_unavailable_store_propagates() {
        let h = harness(&["phone", "laptop"]);
        h.store.set_offline(true);
        let err = tokio_test::block_on(h.scheduler.check_and_train("u", t0())).unwrap_err();
        assert!(matches!(err, TrackerError::StorageUnavailable(_)));
    }
}
