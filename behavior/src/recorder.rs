//! Pairwise behaviour recording
//!
//! Every comparison of two devices' fixes becomes one immutable
//! [`BehaviorRecord`] in the append-only log, and folds into each device's
//! rolling [`DevicePattern`].

use crate::features::FeatureVector;
use crate::store::DocumentStore;
use crate::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tandem_geo::{DeviceFix, Position, ZoneId, ZoneLayout, OUTSIDE_ZONE_ID};

/// Movement window length per device
pub const MOVEMENT_WINDOW_LEN: usize = 100;
/// Number of typical zones kept per device
pub const TYPICAL_ZONE_COUNT: usize = 3;
/// Both devices must exceed this speed to count as moving together (m/s)
pub const MOVING_SPEED_MPS: f64 = 0.5;
/// ...and be closer than this (meters)
pub const MOVING_TOGETHER_RADIUS_M: f64 = 50.0;

/// One pairwise comparison event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorRecord {
    pub user_id: String,
    pub device1_id: String,
    pub device2_id: String,
    pub distance_m: f64,
    pub zone1_id: ZoneId,
    pub zone2_id: ZoneId,
    pub both_inside: bool,
    pub speed1_mps: f64,
    pub speed2_mps: f64,
    pub time_of_day_hour: u32,
    pub day_of_week: u32,
    pub same_zone: bool,
    pub device1_outside: bool,
    pub device2_outside: bool,
    pub moving_together: bool,
    pub zone_difference: u8,
    pub timestamp: DateTime<Utc>,
    pub device1_position: Position,
    pub device2_position: Position,
    /// Each device's own fix time; `timestamp` is the later of the two
    pub device1_timestamp: DateTime<Utc>,
    pub device2_timestamp: DateTime<Utc>,
}

impl BehaviorRecord {
    /// Feature vector in schema order
    pub fn features(&self) -> FeatureVector {
        let (device1_departed, device2_departed) =
            FeatureVector::departures(self.zone1_id, self.zone2_id);

        FeatureVector {
            distance_m: self.distance_m,
            zone1_id: self.zone1_id,
            zone2_id: self.zone2_id,
            both_inside: self.both_inside,
            speed1_mps: self.speed1_mps,
            speed2_mps: self.speed2_mps,
            time_of_day_hour: self.time_of_day_hour,
            day_of_week: self.day_of_week,
            same_zone: self.same_zone,
            device1_outside: self.device1_outside,
            device2_outside: self.device2_outside,
            moving_together: self.moving_together,
            zone_difference: self.zone_difference,
            speed_difference: (self.speed1_mps - self.speed2_mps).abs(),
            device1_departed,
            device2_departed,
        }
    }

    pub fn involves(&self, device_id: &str) -> bool {
        self.device1_id == device_id || self.device2_id == device_id
    }

    /// Position and fix time of a device in this record
    pub fn prior_of(&self, device_id: &str) -> Option<PriorPosition> {
        if self.device1_id == device_id {
            Some(PriorPosition {
                position: self.device1_position,
                timestamp: self.device1_timestamp,
            })
        } else if self.device2_id == device_id {
            Some(PriorPosition {
                position: self.device2_position,
                timestamp: self.device2_timestamp,
            })
        } else {
            None
        }
    }
}

/// Last known position of a device in the behaviour log
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorPosition {
    pub position: Position,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a device's movement window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementSample {
    pub speed_mps: f64,
    pub timestamp: DateTime<Utc>,
    pub zone_id: ZoneId,
}

/// Rolling behaviour summary for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePattern {
    pub user_id: String,
    pub device_id: String,
    pub zone_visits: BTreeMap<ZoneId, u64>,
    pub typical_zones: Vec<ZoneId>,
    pub companion_device_ids: BTreeSet<String>,
    pub movement_window: VecDeque<MovementSample>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DevicePattern {
    pub fn new(user_id: &str, device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            zone_visits: BTreeMap::new(),
            typical_zones: Vec::new(),
            companion_device_ids: BTreeSet::new(),
            movement_window: VecDeque::with_capacity(MOVEMENT_WINDOW_LEN),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold one observation into the pattern
    pub fn observe(&mut self, zone_id: ZoneId, speed_mps: f64, companion_id: &str, at: DateTime<Utc>) {
        *self.zone_visits.entry(zone_id).or_insert(0) += 1;
        self.companion_device_ids.insert(companion_id.to_string());

        if self.movement_window.len() >= MOVEMENT_WINDOW_LEN {
            self.movement_window.pop_front();
        }
        self.movement_window.push_back(MovementSample {
            speed_mps,
            timestamp: at,
            zone_id,
        });

        self.updated_at = at;
        self.typical_zones = self.top_zones();
    }

    /// Most visited zones inside the campus, busiest first
    fn top_zones(&self) -> Vec<ZoneId> {
        let mut visited: Vec<(ZoneId, u64)> = self
            .zone_visits
            .iter()
            .filter(|&(&zone, &count)| zone != OUTSIDE_ZONE_ID && count > 0)
            .map(|(&zone, &count)| (zone, count))
            .collect();

        visited.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        visited.into_iter().take(TYPICAL_ZONE_COUNT).map(|(zone, _)| zone).collect()
    }

    pub fn total_visits(&self) -> u64 {
        self.zone_visits.values().sum()
    }

    /// Share of visits per zone, in percent
    pub fn zone_percentages(&self) -> BTreeMap<ZoneId, f64> {
        let total = self.total_visits();
        self.zone_visits
            .iter()
            .map(|(&zone, &count)| {
                let pct = if total > 0 { count as f64 / total as f64 * 100.0 } else { 0.0 };
                (zone, pct)
            })
            .collect()
    }

    pub fn mean_speed(&self) -> f64 {
        if self.movement_window.is_empty() {
            return 0.0;
        }
        self.movement_window.iter().map(|m| m.speed_mps).sum::<f64>() / self.movement_window.len() as f64
    }

    pub fn is_typical(&self, zone_id: ZoneId) -> bool {
        self.typical_zones.contains(&zone_id)
    }
}

/// Caller-facing pattern view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSummary {
    pub device_id: String,
    pub zone_visits: BTreeMap<ZoneId, u64>,
    pub zone_percentages: BTreeMap<ZoneId, f64>,
    pub typical_zones: Vec<ZoneId>,
    pub companion_device_ids: Vec<String>,
    pub movement_samples: usize,
    pub mean_speed_mps: f64,
    pub updated_at: DateTime<Utc>,
}

impl From<&DevicePattern> for PatternSummary {
    fn from(pattern: &DevicePattern) -> Self {
        Self {
            device_id: pattern.device_id.clone(),
            zone_visits: pattern.zone_visits.clone(),
            zone_percentages: pattern.zone_percentages(),
            typical_zones: pattern.typical_zones.clone(),
            companion_device_ids: pattern.companion_device_ids.iter().cloned().collect(),
            movement_samples: pattern.movement_window.len(),
            mean_speed_mps: pattern.mean_speed(),
            updated_at: pattern.updated_at,
        }
    }
}

/// Aggregate of recent records for one device pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSummary {
    pub device1_id: String,
    pub device2_id: String,
    pub avg_distance_m: f64,
    pub same_zone_count: usize,
    pub moving_together_count: usize,
    pub total_samples: usize,
}

/// Group records by device pair, in first-seen order
pub fn summarize_pairs(records: &[BehaviorRecord]) -> Vec<PairSummary> {
    let mut summaries: Vec<PairSummary> = Vec::new();

    for record in records {
        let idx = match summaries
            .iter()
            .position(|s| s.device1_id == record.device1_id && s.device2_id == record.device2_id)
        {
            Some(idx) => idx,
            None => {
                summaries.push(PairSummary {
                    device1_id: record.device1_id.clone(),
                    device2_id: record.device2_id.clone(),
                    avg_distance_m: 0.0,
                    same_zone_count: 0,
                    moving_together_count: 0,
                    total_samples: 0,
                });
                summaries.len() - 1
            }
        };

        let s = &mut summaries[idx];
        s.total_samples += 1;
        s.avg_distance_m += (record.distance_m - s.avg_distance_m) / s.total_samples as f64;
        s.same_zone_count += usize::from(record.same_zone);
        s.moving_together_count += usize::from(record.moving_together);
    }

    summaries
}

/// Speed between a prior position and a new one; zero without history or elapsed time
pub fn speed_since(prior: Option<&PriorPosition>, position: Position, at: DateTime<Utc>) -> f64 {
    let Some(prior) = prior else {
        return 0.0;
    };

    let elapsed = (at - prior.timestamp).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return 0.0;
    }

    prior.position.distance_to(&position) / elapsed
}

/// Derive a record from two zone-tagged fixes and their prior positions.
///
/// Pure: identical inputs always give identical records.
pub fn derive_record(
    user_id: &str,
    fix1: &DeviceFix,
    fix2: &DeviceFix,
    layout: &ZoneLayout,
    prior1: Option<&PriorPosition>,
    prior2: Option<&PriorPosition>,
) -> BehaviorRecord {
    let timestamp = fix1.timestamp.max(fix2.timestamp);
    let distance_m = fix1.position.distance_to(&fix2.position);

    let zone1_id = layout.classify_id(fix1.position.lat, fix1.position.lon);
    let zone2_id = layout.classify_id(fix2.position.lat, fix2.position.lon);

    let speed1_mps = speed_since(prior1, fix1.position, fix1.timestamp);
    let speed2_mps = speed_since(prior2, fix2.position, fix2.timestamp);

    let moving_together = speed1_mps > MOVING_SPEED_MPS
        && speed2_mps > MOVING_SPEED_MPS
        && distance_m < MOVING_TOGETHER_RADIUS_M;

    BehaviorRecord {
        user_id: user_id.to_string(),
        device1_id: fix1.device_id.clone(),
        device2_id: fix2.device_id.clone(),
        distance_m,
        zone1_id,
        zone2_id,
        both_inside: zone1_id != OUTSIDE_ZONE_ID && zone2_id != OUTSIDE_ZONE_ID,
        speed1_mps,
        speed2_mps,
        time_of_day_hour: timestamp.hour(),
        day_of_week: timestamp.weekday().num_days_from_monday(),
        same_zone: zone1_id == zone2_id,
        device1_outside: zone1_id == OUTSIDE_ZONE_ID,
        device2_outside: zone2_id == OUTSIDE_ZONE_ID,
        moving_together,
        zone_difference: zone1_id.abs_diff(zone2_id),
        timestamp,
        device1_position: fix1.position,
        device2_position: fix2.position,
        device1_timestamp: fix1.timestamp,
        device2_timestamp: fix2.timestamp,
    }
}

/// Behaviour recorder
pub struct BehaviorRecorder {
    store: Arc<dyn DocumentStore>,
}

impl BehaviorRecorder {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Compare two devices' fixes, append the record and update both patterns
    pub fn record_pair(
        &self,
        user_id: &str,
        fix1: &DeviceFix,
        fix2: &DeviceFix,
        layout: &ZoneLayout,
    ) -> Result<BehaviorRecord> {
        let prior1 = self.store.last_position(user_id, &fix1.device_id)?;
        let prior2 = self.store.last_position(user_id, &fix2.device_id)?;

        let record = derive_record(user_id, fix1, fix2, layout, prior1.as_ref(), prior2.as_ref());

        self.store.append_behavior(&record)?;

        self.update_pattern(user_id, &record.device1_id, record.zone1_id, record.speed1_mps, &record.device2_id, record.timestamp)?;
        self.update_pattern(user_id, &record.device2_id, record.zone2_id, record.speed2_mps, &record.device1_id, record.timestamp)?;

        tracing::debug!(
            user_id,
            "Recorded pair {} / {}: {:.1}m apart, zones {} / {}",
            record.device1_id,
            record.device2_id,
            record.distance_m,
            record.zone1_id,
            record.zone2_id
        );

        Ok(record)
    }

    fn update_pattern(
        &self,
        user_id: &str,
        device_id: &str,
        zone_id: ZoneId,
        speed_mps: f64,
        companion_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.store.update_pattern(user_id, device_id, at, &mut |pattern| {
            pattern.observe(zone_id, speed_mps, companion_id, at);
        })?;
        Ok(())
    }
}
