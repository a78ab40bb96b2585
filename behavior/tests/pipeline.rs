//! End-to-end runs through the tracker: validation, pairing, training and
//! notification delivery.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tandem_behavior::{
    AnomalyModel, FanoutNotifier, FileArtifactStore, MemoryStore, Notification, NotificationHub,
    NotificationJournal, Notifier, StartOutcome, Tracker, TrackerConfig, TrackerError, TrainingPhase,
};
use tandem_geo::{distance, Position, ValidationReason};
use tokio::sync::mpsc::UnboundedReceiver;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 14, 30, 0).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(n) = rx.try_recv() {
        seen.push(n);
    }
    seen
}

fn memory_tracker(dir: &std::path::Path) -> (Tracker, Arc<MemoryStore>, Arc<NotificationHub>) {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(NotificationHub::new());
    let artifacts = Arc::new(FileArtifactStore::new(&dir.join("models")).unwrap());
    let tracker = Tracker::new(TrackerConfig::default(), store.clone(), artifacts, hub.clone());
    (tracker, store, hub)
}

#[tokio::test]
async fn anchored_device_is_constrained_to_drift_radius() {
    let dir = tempfile::tempdir().unwrap();
    let (tracker, _, hub) = memory_tracker(dir.path());
    let mut rx = hub.subscribe("alice");

    tracker.register_device("alice", "phone", t0()).unwrap();

    let first = tracker.ingest_fix("alice", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap();
    assert_eq!(first.reason, ValidationReason::HighAccuracyAccepted);

    let second = tracker
        .ingest_fix("alice", "phone", 10.0001, 10.0001, 10.0, t0() + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(second.reason, ValidationReason::ConstrainedToRadius);

    let position = second.position.unwrap();
    let moved = distance(10.0, 10.0, position.lat, position.lon);
    assert!((moved - 3.0).abs() < 0.01, "moved {}", moved);
    assert!(second.drift_m.unwrap() > 3.0);

    let names: Vec<&str> = drain(&mut rx).iter().map(|n| n.name()).collect();
    assert_eq!(names, ["location_update", "location_update"]);
}

#[tokio::test]
async fn rejected_fix_leaves_live_position_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let (tracker, store, hub) = memory_tracker(dir.path());
    let mut rx = hub.subscribe("alice");
    tracker.register_device("alice", "phone", t0()).unwrap();

    tracker.ingest_fix("alice", "phone", 10.0, 10.0, 2.0, t0()).await.unwrap();
    let outcome = tracker
        .ingest_fix("alice", "phone", 11.0, 11.0, 120.0, t0() + Duration::seconds(5))
        .await
        .unwrap();
    assert!(!outcome.accepted);

    use tandem_behavior::DocumentStore;
    let fix = store.current_fix("alice", "phone").unwrap().unwrap();
    assert_eq!(fix.position, Position::new(10.0, 10.0));

    let seen = drain(&mut rx);
    assert!(matches!(
        seen.last(),
        Some(Notification::LocationRejected {
            reason: ValidationReason::AccuracyTooLow,
            ..
        })
    ));
}

#[tokio::test]
async fn unregistered_device_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let (tracker, _, _) = memory_tracker(dir.path());
    tracker.register_device("alice", "phone", t0()).unwrap();

    let err = tracker
        .ingest_fix("alice", "tablet", 10.0, 10.0, 2.0, t0())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::InvalidInput(_)));
}

#[tokio::test]
async fn collection_trains_and_persists_a_model() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(NotificationHub::new());
    let journal = Arc::new(NotificationJournal::new(&dir.path().join("journal")).unwrap());
    let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(vec![hub.clone(), journal.clone()]));
    let artifacts = Arc::new(FileArtifactStore::new(&dir.path().join("models")).unwrap());
    let tracker = Tracker::new(TrackerConfig::default(), store.clone(), artifacts, notifier);

    let mut rx = hub.subscribe("alice");
    tracker.register_device("alice", "phone", t0()).unwrap();
    tracker.register_device("alice", "laptop", t0()).unwrap();
    assert_eq!(
        tracker.request_training_start("alice", t0()).unwrap(),
        StartOutcome::AlreadyInProgress
    );

    // Both devices strolling through the middle of campus together
    let mut records = 0;
    for i in 0..16 {
        let at = t0() + Duration::seconds(20 * i);
        let lat = 10.0 + 0.00001 * (i % 4) as f64;
        records += tracker.ingest_fix("alice", "phone", lat, 10.0, 2.0, at).await.unwrap().pairs_recorded;
        records += tracker
            .ingest_fix("alice", "laptop", lat, 10.00001, 2.0, at + Duration::seconds(5))
            .await
            .unwrap()
            .pairs_recorded;
    }
    assert_eq!(records, 31);

    let status = tracker.get_training_status("alice", t0() + Duration::minutes(6)).unwrap();
    assert_eq!(status.phase, TrainingPhase::Trained);
    assert!(status.is_trained);
    assert_eq!(status.message, "Security system active");
    assert_eq!(status.model_info.as_ref().map(|i| i.sample_count), Some(30));

    let artifact = dir.path().join("models").join("alice.model.json");
    let model = AnomalyModel::from_bytes(&std::fs::read(&artifact).unwrap()).unwrap();
    assert_eq!(model.sample_count, 30);
    assert!(model.is_typical_zone("phone", 4));

    let seen = drain(&mut rx);
    let complete = seen.iter().filter(|n| n.name() == "ml_training_complete").count();
    assert_eq!(complete, 1);

    let journaled = journal.load("alice").unwrap();
    assert_eq!(journaled.len(), seen.len());
    assert_eq!(journaled.last().map(|e| e.notification.name()), seen.last().map(|n| n.name()));

    let patterns = tracker.get_device_patterns("alice").unwrap();
    assert_eq!(patterns[0].typical_zones, vec![4]);
}
