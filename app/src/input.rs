//! Line-delimited JSON commands
//!
//! Shared by the daemon's stdin loop and `tandem-cli replay`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_behavior::{StartOutcome, Tracker, TrackerError, TrainingStatusView, ValidationOutcome};

/// One input command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Register {
        user_id: String,
        device_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Fix {
        user_id: String,
        device_id: String,
        lat: f64,
        lon: f64,
        accuracy_m: f64,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    StartTraining {
        user_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Status {
        user_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl Command {
    pub fn user_id(&self) -> &str {
        match self {
            Command::Register { user_id, .. }
            | Command::Fix { user_id, .. }
            | Command::StartTraining { user_id, .. }
            | Command::Status { user_id, .. } => user_id,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Command::Register { timestamp, .. }
            | Command::Fix { timestamp, .. }
            | Command::StartTraining { timestamp, .. }
            | Command::Status { timestamp, .. } => *timestamp,
        }
    }
}

/// Reply written back for each command
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Registered {
        user_id: String,
        device_id: String,
        device_count: usize,
    },
    Fix(ValidationOutcome),
    TrainingStart {
        user_id: String,
        outcome: String,
        message: String,
    },
    Status(TrainingStatusView),
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Parse one input line; blank lines and `#` comments yield `None`
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<Command>, InputError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|source| InputError::Parse { line: line_no, source })
}

/// Run one command against the tracker. Commands without a timestamp use `now`.
pub async fn execute(tracker: &Tracker, command: Command, now: DateTime<Utc>) -> Result<Response, InputError> {
    let at = command.timestamp().unwrap_or(now);

    let response = match command {
        Command::Register { user_id, device_id, .. } => {
            let device_count = tracker.register_device(&user_id, &device_id, at)?;
            Response::Registered {
                user_id,
                device_id,
                device_count,
            }
        }
        Command::Fix {
            user_id,
            device_id,
            lat,
            lon,
            accuracy_m,
            ..
        } => Response::Fix(tracker.ingest_fix(&user_id, &device_id, lat, lon, accuracy_m, at).await?),
        Command::StartTraining { user_id, .. } => {
            let (outcome, message) = match tracker.request_training_start(&user_id, at)? {
                StartOutcome::Started(_) => ("started", "ML training started".to_string()),
                StartOutcome::AlreadyInProgress => ("already_in_progress", "Training already in progress or completed".to_string()),
                StartOutcome::InsufficientDevices { device_count } => (
                    "insufficient_devices",
                    format!("Need at least 2 devices, have {}", device_count),
                ),
            };
            Response::TrainingStart {
                user_id,
                outcome: outcome.to_string(),
                message,
            }
        }
        Command::Status { user_id, .. } => Response::Status(tracker.get_training_status(&user_id, at)?),
    };

    Ok(response)
}
