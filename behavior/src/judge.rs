//! Anomaly judges
//!
//! A judge looks at one behaviour record and returns verdicts, either about
//! the pair as a whole or about one of its devices. The [`JudgePanel`]
//! combines the verdicts of several judges into the notifications to emit.

use crate::model::{AnomalyModel, Score};
use crate::recorder::BehaviorRecord;
use crate::{AlertDetails, AnomalyAlert, Notification};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_geo::{ZoneId, OUTSIDE_ZONE_ID};

pub const PAIR_ALERT_MESSAGE: &str = "Unusual device behavior detected!";

/// What a verdict is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Pair,
    Device(String),
}

/// One judge's opinion
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub judge: &'static str,
    pub scope: Scope,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub reasons: Vec<String>,
    /// Present for verdicts backed by the statistical model
    pub score: Option<Score>,
}

/// Capability shared by statistical and rule-based detection
pub trait AnomalyJudge: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, record: &BehaviorRecord) -> Vec<Verdict>;
}

/// Judges the pair with the user's trained model
pub struct StatisticalJudge {
    model: Arc<AnomalyModel>,
}

impl StatisticalJudge {
    pub fn new(model: Arc<AnomalyModel>) -> Self {
        Self { model }
    }
}

impl AnomalyJudge for StatisticalJudge {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn evaluate(&self, record: &BehaviorRecord) -> Vec<Verdict> {
        let score = self.model.score(&record.features());
        let reasons = if score.is_anomaly {
            vec![format!("Outlier score {:.3} below threshold {:.3}", score.score, score.threshold)]
        } else {
            Vec::new()
        };

        vec![Verdict {
            judge: self.name(),
            scope: Scope::Pair,
            is_anomaly: score.is_anomaly,
            confidence: score.confidence,
            reasons,
            score: Some(score),
        }]
    }
}

/// Zones considered unusual after a given hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneCurfew {
    pub zone_ids: Vec<ZoneId>,
    /// Rule applies when the hour is strictly greater than this
    pub after_hour: u32,
}

/// Rule thresholds for the heuristic judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicPolicy {
    pub max_speed_mps: f64,
    pub curfews: Vec<ZoneCurfew>,
}

impl Default for HeuristicPolicy {
    fn default() -> Self {
        Self {
            max_speed_mps: 5.0,
            curfews: vec![ZoneCurfew {
                zone_ids: vec![1, 2],
                after_hour: 18,
            }],
        }
    }
}

/// One device's side of a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceState {
    pub zone_id: ZoneId,
    pub speed_mps: f64,
    pub hour: u32,
}

/// The other device of the pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompanionState {
    pub zone_id: ZoneId,
    pub distance_m: f64,
}

/// Outcome of the rule-based check
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicFinding {
    pub is_anomaly: bool,
    pub reasons: Vec<String>,
    pub confidence: f64,
}

/// Rule confidence: 0.7 plus 0.1 per triggered rule, at most 0.95
pub fn heuristic_confidence(reasons: usize) -> f64 {
    (0.7 + 0.1 * reasons as f64).min(0.95)
}

/// Rule-based judge, usable before any model is trained
#[derive(Debug, Clone, Default)]
pub struct HeuristicJudge {
    policy: HeuristicPolicy,
}

impl HeuristicJudge {
    pub fn new(policy: HeuristicPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &HeuristicPolicy {
        &self.policy
    }

    pub fn heuristic_check(&self, device: &DeviceState, companion: Option<&CompanionState>) -> HeuristicFinding {
        let mut reasons = Vec::new();

        if device.speed_mps > self.policy.max_speed_mps {
            reasons.push(format!("High speed: {:.1} m/s", device.speed_mps));
        }

        if let Some(companion) = companion {
            if device.zone_id == OUTSIDE_ZONE_ID && companion.zone_id != OUTSIDE_ZONE_ID {
                reasons.push("Device left campus while companion stayed".to_string());
            } else if device.zone_id != OUTSIDE_ZONE_ID && companion.zone_id == OUTSIDE_ZONE_ID {
                reasons.push("Companion left campus while device stayed".to_string());
            }
        }

        let after_curfew = self
            .policy
            .curfews
            .iter()
            .any(|c| device.hour > c.after_hour && c.zone_ids.contains(&device.zone_id));
        if after_curfew {
            reasons.push("Unusual location for evening hours".to_string());
        }

        let is_anomaly = !reasons.is_empty();
        HeuristicFinding {
            is_anomaly,
            confidence: if is_anomaly { heuristic_confidence(reasons.len()) } else { 0.0 },
            reasons,
        }
    }
}

impl AnomalyJudge for HeuristicJudge {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn evaluate(&self, record: &BehaviorRecord) -> Vec<Verdict> {
        let sides = [
            (&record.device1_id, record.zone1_id, record.speed1_mps, record.zone2_id),
            (&record.device2_id, record.zone2_id, record.speed2_mps, record.zone1_id),
        ];

        sides
            .into_iter()
            .map(|(device_id, zone_id, speed_mps, companion_zone)| {
                let device = DeviceState {
                    zone_id,
                    speed_mps,
                    hour: record.time_of_day_hour,
                };
                let companion = CompanionState {
                    zone_id: companion_zone,
                    distance_m: record.distance_m,
                };
                let finding = self.heuristic_check(&device, Some(&companion));

                Verdict {
                    judge: self.name(),
                    scope: Scope::Device(device_id.clone()),
                    is_anomaly: finding.is_anomaly,
                    confidence: finding.confidence,
                    reasons: finding.reasons,
                    score: None,
                }
            })
            .collect()
    }
}

/// How the panel turns verdicts into notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelPolicy {
    /// Device verdicts are reported only alongside an anomalous pair verdict
    #[default]
    Corroborated,
    /// Every anomalous verdict is reported
    Union,
}

/// Display context for a record's alert
#[derive(Debug, Clone, PartialEq)]
pub struct PairContext {
    pub device1_zone: String,
    pub device2_zone: String,
    pub device1_zone_typical: bool,
    pub device2_zone_typical: bool,
}

/// A set of judges and the policy combining them
pub struct JudgePanel {
    judges: Vec<Arc<dyn AnomalyJudge>>,
    policy: PanelPolicy,
}

impl JudgePanel {
    pub fn new(policy: PanelPolicy) -> Self {
        Self {
            judges: Vec::new(),
            policy,
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn AnomalyJudge>) -> Self {
        self.judges.push(judge);
        self
    }

    pub fn judge_names(&self) -> Vec<&'static str> {
        self.judges.iter().map(|j| j.name()).collect()
    }

    /// Notifications for one record: the pair alert first, then device alerts
    pub fn decide(&self, record: &BehaviorRecord, context: &PairContext) -> Vec<Notification> {
        let verdicts: Vec<Verdict> = self.judges.iter().flat_map(|j| j.evaluate(record)).collect();

        let pair = verdicts
            .iter()
            .find(|v| v.scope == Scope::Pair && v.is_anomaly && v.score.is_some());

        let device_reasons = |device_id: &str| -> Vec<String> {
            verdicts
                .iter()
                .filter(|v| v.is_anomaly && v.scope == Scope::Device(device_id.to_string()))
                .flat_map(|v| v.reasons.iter().cloned())
                .collect()
        };
        let device1_reasons = device_reasons(&record.device1_id);
        let device2_reasons = device_reasons(&record.device2_id);

        let report_devices = match self.policy {
            PanelPolicy::Corroborated => pair.is_some(),
            PanelPolicy::Union => true,
        };

        let mut out = Vec::new();

        if let Some(Verdict { score: Some(score), .. }) = pair {
            tracing::warn!(
                user_id = %record.user_id,
                "Pair anomaly {} / {}: score {:.3} < {:.3}",
                record.device1_id,
                record.device2_id,
                score.score,
                score.threshold
            );

            out.push(Notification::AnomalyAlert(AnomalyAlert {
                message: PAIR_ALERT_MESSAGE.to_string(),
                device1_id: record.device1_id.clone(),
                device2_id: record.device2_id.clone(),
                device1_zone: context.device1_zone.clone(),
                device2_zone: context.device2_zone.clone(),
                distance_m: record.distance_m,
                confidence: score.confidence,
                score: score.score,
                threshold: score.threshold,
                cluster_distance: score.cluster_distance,
                timestamp: record.timestamp,
                details: AlertDetails {
                    pair_anomaly: true,
                    device1_anomaly: !device1_reasons.is_empty(),
                    device2_anomaly: !device2_reasons.is_empty(),
                    device1_reasons: device1_reasons.clone(),
                    device2_reasons: device2_reasons.clone(),
                    device1_zone_typical: context.device1_zone_typical,
                    device2_zone_typical: context.device2_zone_typical,
                    assigned_cluster: score.assigned_cluster,
                    features: score.features,
                },
            }));
        }

        if report_devices {
            for (device_id, reasons) in [(&record.device1_id, device1_reasons), (&record.device2_id, device2_reasons)] {
                if reasons.is_empty() {
                    continue;
                }
                out.push(Notification::IndividualAnomaly {
                    device_id: device_id.clone(),
                    confidence: heuristic_confidence(reasons.len()),
                    reasons,
                    timestamp: record.timestamp,
                });
            }
        }

        out
    }
}
