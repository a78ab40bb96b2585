//! Behaviour feature schema
//!
//! The model sees every pairwise comparison as a fixed, ordered vector of
//! [`FEATURE_COUNT`] values. The order is part of the persisted model
//! contract: any change to it must bump [`FEATURE_SCHEMA_VERSION`] so
//! artifacts trained under the old order are refused.

use serde::{Deserialize, Serialize};
use tandem_geo::{ZoneId, OUTSIDE_ZONE_ID};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const FEATURE_COUNT: usize = 16;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "distance_m",
    "zone1_id",
    "zone2_id",
    "both_inside",
    "speed1_mps",
    "speed2_mps",
    "time_of_day_hour",
    "day_of_week",
    "same_zone",
    "device1_outside",
    "device2_outside",
    "moving_together",
    "zone_difference",
    "speed_difference",
    "device1_departed",
    "device2_departed",
];

/// Typed feature vector for one pairwise comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
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
    pub speed_difference: f64,
    /// Device 1 is outside while device 2 is still inside
    pub device1_departed: bool,
    /// Device 2 is outside while device 1 is still inside
    pub device2_departed: bool,
}

impl FeatureVector {
    /// Values in schema order
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.distance_m,
            f64::from(self.zone1_id),
            f64::from(self.zone2_id),
            flag(self.both_inside),
            self.speed1_mps,
            self.speed2_mps,
            f64::from(self.time_of_day_hour),
            f64::from(self.day_of_week),
            flag(self.same_zone),
            flag(self.device1_outside),
            flag(self.device2_outside),
            flag(self.moving_together),
            f64::from(self.zone_difference),
            self.speed_difference,
            flag(self.device1_departed),
            flag(self.device2_departed),
        ]
    }

    /// Derive the two departure flags from zone ids
    pub(crate) fn departures(zone1: ZoneId, zone2: ZoneId) -> (bool, bool) {
        (
            zone1 == OUTSIDE_ZONE_ID && zone2 != OUTSIDE_ZONE_ID,
            zone1 != OUTSIDE_ZONE_ID && zone2 == OUTSIDE_ZONE_ID,
        )
    }

    /// Named view, for audit payloads
    pub fn named(&self) -> Vec<(&'static str, f64)> {
        FEATURE_NAMES.iter().copied().zip(self.to_array()).collect()
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
