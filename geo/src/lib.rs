//! Tandem Geospatial Layer
//!
//! Turns noisy, untrusted GPS fixes into stable positions and maps them
//! into a user's campus zones.
//!
//! # Modules
//!
//! - [`math`] - haversine distance, initial bearing, destination projection
//! - [`validator`] - accuracy policy and drift constraint against a device anchor
//! - [`zones`] - rectangular zone layouts and point classification
//!
//! # Example
//!
//! ```rust
//! use tandem_geo::{FixValidator, RawFix, ValidationReason};
//!
//! let validator = FixValidator::default();
//! let raw = RawFix::new("phone", 10.0, 10.0, 2.0, chrono::Utc::now()).unwrap();
//! let validation = validator.validate(None, &raw);
//!
//! assert_eq!(validation.reason, ValidationReason::HighAccuracyAccepted);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod math;
pub mod validator;
pub mod zones;

// Re-exports for convenience
pub use math::{bearing, destination, distance, EARTH_RADIUS_M};
pub use validator::{FixValidator, Validation, ValidationReason, ValidatorConfig};
pub use zones::{
    classify, Bounds, LayoutConfig, SectionTemplate, Zone, ZoneId, ZoneLayout, OUTSIDE_ZONE,
    OUTSIDE_ZONE_ID,
};

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance to another position in meters
    pub fn distance_to(&self, other: &Position) -> f64 {
        distance(self.lat, self.lon, other.lat, other.lon)
    }
}

/// A fix exactly as reported by a device, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFix {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}

impl RawFix {
    /// Build a raw fix, rejecting values that are not usable coordinates
    pub fn new(
        device_id: &str,
        lat: f64,
        lon: f64,
        accuracy_m: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        if device_id.is_empty() {
            return Err(GeoError::InvalidInput("device id is empty".to_string()));
        }
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(GeoError::InvalidInput(format!("latitude {} out of range", lat)));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(GeoError::InvalidInput(format!("longitude {} out of range", lon)));
        }
        if !accuracy_m.is_finite() || accuracy_m < 0.0 {
            return Err(GeoError::InvalidInput(format!("accuracy {} is not a distance", accuracy_m)));
        }

        Ok(Self {
            device_id: device_id.to_string(),
            lat,
            lon,
            accuracy_m,
            timestamp,
        })
    }

    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lon)
    }
}

/// Best high-confidence fix ever accepted for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub position: Position,
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}

/// Live location row for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFix {
    pub device_id: String,
    pub raw_position: Position,
    pub raw_accuracy_m: f64,
    pub position: Position,
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
    pub validation_reason: ValidationReason,
    pub anchor: Option<Anchor>,
    pub zone_name: String,
}

impl DeviceFix {
    /// Build the next live row for a device from an accepted validation.
    ///
    /// Returns `None` for rejected fixes. The anchor moves only when the
    /// validation qualifies as high accuracy; otherwise it is carried over
    /// from `previous`.
    pub fn from_validation(
        raw: &RawFix,
        validation: &Validation,
        previous: Option<&DeviceFix>,
        zone_name: &str,
    ) -> Option<Self> {
        let position = validation.position?;
        let accuracy_m = validation.accuracy_m?;

        let anchor = if validation.updates_anchor() {
            Some(Anchor {
                position,
                accuracy_m,
                timestamp: raw.timestamp,
            })
        } else {
            previous.and_then(|p| p.anchor.clone())
        };

        Some(Self {
            device_id: raw.device_id.clone(),
            raw_position: raw.position(),
            raw_accuracy_m: raw.accuracy_m,
            position,
            accuracy_m,
            timestamp: raw.timestamp,
            validation_reason: validation.reason,
            anchor,
            zone_name: zone_name.to_string(),
        })
    }
}

/// Geo layer error types
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),
}

pub type Result<T> = std::result::Result<T, GeoError>;
