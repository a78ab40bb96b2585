//! GPS fix validation
//!
//! Classifies each incoming fix by its reported accuracy. High-accuracy
//! fixes become the device's anchor; medium-accuracy fixes that land too
//! far from the anchor are pulled back onto the drift radius along the
//! same bearing, so a single noisy reading cannot teleport the device.

use crate::math::{bearing, destination, distance, EARTH_RADIUS_M};
use crate::{Anchor, Position, RawFix};
use serde::{Deserialize, Serialize};

/// Validator thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Fixes reporting worse accuracy than this are rejected (meters)
    pub max_acceptable_accuracy_m: f64,
    /// Fixes reporting better accuracy than this become the anchor (meters)
    pub high_accuracy_threshold_m: f64,
    /// Largest distance a medium-accuracy fix may sit from the anchor (meters)
    pub max_drift_m: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_acceptable_accuracy_m: 50.0,
            high_accuracy_threshold_m: 3.0,
            max_drift_m: 3.0,
        }
    }
}

/// Why a fix was accepted, constrained or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    AccuracyTooLow,
    HighAccuracyAccepted,
    FirstLocationAccepted,
    MediumAccuracyAccepted,
    ConstrainedToRadius,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::AccuracyTooLow => "accuracy_too_low",
            ValidationReason::HighAccuracyAccepted => "high_accuracy_accepted",
            ValidationReason::FirstLocationAccepted => "first_location_accepted",
            ValidationReason::MediumAccuracyAccepted => "medium_accuracy_accepted",
            ValidationReason::ConstrainedToRadius => "constrained_to_radius",
        }
    }
}

impl std::fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating one fix
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub reason: ValidationReason,
    /// Accepted (possibly constrained) position; `None` when rejected
    pub position: Option<Position>,
    pub accuracy_m: Option<f64>,
    /// Distance from the anchor to the raw fix, when an anchor was consulted
    pub drift_m: Option<f64>,
}

impl Validation {
    fn rejected(reason: ValidationReason) -> Self {
        Self {
            reason,
            position: None,
            accuracy_m: None,
            drift_m: None,
        }
    }

    fn accepted(reason: ValidationReason, position: Position, accuracy_m: f64, drift_m: Option<f64>) -> Self {
        Self {
            reason,
            position: Some(position),
            accuracy_m: Some(accuracy_m),
            drift_m,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.position.is_some()
    }

    /// Only high-accuracy acceptances move the anchor
    pub fn updates_anchor(&self) -> bool {
        self.reason == ValidationReason::HighAccuracyAccepted
    }
}

/// Fix validator
#[derive(Debug, Clone, Default)]
pub struct FixValidator {
    config: ValidatorConfig,
}

impl FixValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate a raw fix against the device's current anchor
    pub fn validate(&self, anchor: Option<&Anchor>, raw: &RawFix) -> Validation {
        let short_id: String = raw.device_id.chars().take(8).collect();

        if raw.accuracy_m > self.config.max_acceptable_accuracy_m {
            tracing::warn!(
                device_id = %raw.device_id,
                accuracy = raw.accuracy_m,
                "Rejected fix from {}: accuracy {:.1}m too low",
                short_id,
                raw.accuracy_m
            );
            return Validation::rejected(ValidationReason::AccuracyTooLow);
        }

        if raw.accuracy_m < self.config.high_accuracy_threshold_m {
            tracing::debug!("High accuracy fix from {}: {:.1}m", short_id, raw.accuracy_m);
            return Validation::accepted(
                ValidationReason::HighAccuracyAccepted,
                raw.position(),
                raw.accuracy_m,
                None,
            );
        }

        let Some(anchor) = anchor else {
            tracing::debug!("First fix from {}: {:.1}m", short_id, raw.accuracy_m);
            return Validation::accepted(
                ValidationReason::FirstLocationAccepted,
                raw.position(),
                raw.accuracy_m,
                None,
            );
        };

        let drift = distance(anchor.position.lat, anchor.position.lon, raw.lat, raw.lon);

        if drift <= self.config.max_drift_m {
            tracing::debug!(
                "Medium accuracy fix from {}: {:.1}m, drift {:.1}m",
                short_id,
                raw.accuracy_m,
                drift
            );
            return Validation::accepted(
                ValidationReason::MediumAccuracyAccepted,
                raw.position(),
                raw.accuracy_m,
                Some(drift),
            );
        }

        let constrained = constrain_to_radius(anchor.position, raw.position(), self.config.max_drift_m);
        tracing::debug!(
            "Constrained fix from {}: drift {:.1}m pulled to {:.1}m",
            short_id,
            drift,
            self.config.max_drift_m
        );

        Validation::accepted(
            ValidationReason::ConstrainedToRadius,
            constrained,
            raw.accuracy_m,
            Some(drift),
        )
    }
}

/// Point at exactly `radius_m` from `anchor` on the bearing towards `target`
pub fn constrain_to_radius(anchor: Position, target: Position, radius_m: f64) -> Position {
    let heading = bearing(anchor.lat, anchor.lon, target.lat, target.lon);
    destination(anchor.lat, anchor.lon, heading, radius_m / EARTH_RADIUS_M)
}
