//! Synthetic behaviour data for unit tests

use crate::recorder::{BehaviorRecord, MOVING_SPEED_MPS, MOVING_TOGETHER_RADIUS_M};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tandem_geo::{Position, ZoneId, OUTSIDE_ZONE_ID};

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 14, 30, 0).unwrap()
}

/// A "phone" / "laptop" record with the given shape
pub(crate) fn pair_record(
    user_id: &str,
    at: DateTime<Utc>,
    distance_m: f64,
    zone1_id: ZoneId,
    zone2_id: ZoneId,
    speed1_mps: f64,
    speed2_mps: f64,
) -> BehaviorRecord {
    BehaviorRecord {
        user_id: user_id.to_string(),
        device1_id: "phone".to_string(),
        device2_id: "laptop".to_string(),
        distance_m,
        zone1_id,
        zone2_id,
        both_inside: zone1_id != OUTSIDE_ZONE_ID && zone2_id != OUTSIDE_ZONE_ID,
        speed1_mps,
        speed2_mps,
        time_of_day_hour: at.hour(),
        day_of_week: at.weekday().num_days_from_monday(),
        same_zone: zone1_id == zone2_id,
        device1_outside: zone1_id == OUTSIDE_ZONE_ID,
        device2_outside: zone2_id == OUTSIDE_ZONE_ID,
        moving_together: speed1_mps > MOVING_SPEED_MPS
            && speed2_mps > MOVING_SPEED_MPS
            && distance_m < MOVING_TOGETHER_RADIUS_M,
        zone_difference: zone1_id.abs_diff(zone2_id),
        timestamp: at,
        device1_position: Position::new(10.0, 10.0),
        device2_position: Position::new(10.0, 10.0),
        device1_timestamp: at,
        device2_timestamp: at,
    }
}

/// Devices carried together around the campus, one record every 10 s
pub(crate) fn normal_records(user_id: &str, n: usize, start: DateTime<Utc>, seed: u64) -> Vec<BehaviorRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    (0..n)
        .map(|i| {
            let zone: ZoneId = rng.gen_range(1..=4);
            let speed = rng.gen_range(0.0..1.2);
            pair_record(
                user_id,
                start + Duration::seconds(10 * i as i64),
                rng.gen_range(0.5..15.0),
                zone,
                zone,
                speed,
                (speed + rng.gen_range(-0.2..0.2_f64)).max(0.0),
            )
        })
        .collect()
}

/// Notifier that remembers everything it was given
#[derive(Default)]
pub(crate) struct CaptureNotifier {
    seen: std::sync::Mutex<Vec<(String, crate::Notification)>>,
}

impl CaptureNotifier {
    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().iter().map(|(_, n)| n.name()).collect()
    }

    pub(crate) fn take(&self) -> Vec<crate::Notification> {
        self.seen.lock().unwrap().drain(..).map(|(_, n)| n).collect()
    }
}

impl crate::Notifier for CaptureNotifier {
    fn notify(&self, user_id: &str, notification: crate::Notification) {
        self.seen.lock().unwrap().push((user_id.to_string(), notification));
    }
}
