//! Notification Journal
//!
//! Append-only JSON-lines log of every notification published for a user,
//! one directory per user under the journal root.

use crate::store::{decode_id, encode_id};
use crate::{Notification, Notifier, Result, TrackerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const JOURNAL_FILE: &str = "notifications.jsonl";

/// One journaled notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub user_id: String,
    pub recorded_at: DateTime<Utc>,
    pub notification: Notification,
}

/// Writes notifications to `<root>/<user>/notifications.jsonl`
pub struct NotificationJournal {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl NotificationJournal {
    pub fn new(base_path: &Path) -> Result<Self> {
        create_dir_all(base_path).map_err(|e| {
            TrackerError::StorageUnavailable(format!("Failed to create journal dir {:?}: {}", base_path, e))
        })?;

        Ok(Self {
            base_path: base_path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn journal_path(&self, user_id: &str) -> PathBuf {
        self.base_path.join(encode_id(user_id)).join(JOURNAL_FILE)
    }

    /// Append one notification
    pub fn append(&self, user_id: &str, notification: &Notification, at: DateTime<Utc>) -> Result<()> {
        let entry = JournalEntry {
            user_id: user_id.to_string(),
            recorded_at: at,
            notification: notification.clone(),
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| TrackerError::StorageUnavailable(format!("Serialization error: {}", e)))?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TrackerError::StorageUnavailable("journal lock poisoned".into()))?;

        let path = self.journal_path(user_id);
        if let Some(dir) = path.parent() {
            create_dir_all(dir)
                .map_err(|e| TrackerError::StorageUnavailable(format!("Failed to create user dir: {}", e)))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrackerError::StorageUnavailable(format!("Failed to open journal: {}", e)))?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", json)
            .map_err(|e| TrackerError::StorageUnavailable(format!("Write error: {}", e)))?;
        writer
            .flush()
            .map_err(|e| TrackerError::StorageUnavailable(format!("Flush error: {}", e)))?;

        Ok(())
    }

    /// Load a user's journal, oldest first. Unparseable lines are skipped.
    pub fn load(&self, user_id: &str) -> Result<Vec<JournalEntry>> {
        let path = self.journal_path(user_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TrackerError::StorageUnavailable(format!("Open error: {}", e))),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| TrackerError::StorageUnavailable(format!("Read error: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(user_id, "Skipping bad journal line: {}", e),
            }
        }

        Ok(entries)
    }

    /// Every journaled user id, sorted
    pub fn users(&self) -> Result<Vec<String>> {
        let mut users = Vec::new();

        for entry in std::fs::read_dir(&self.base_path)
            .map_err(|e| TrackerError::StorageUnavailable(format!("Read dir error: {}", e)))?
        {
            let entry = entry.map_err(|e| TrackerError::StorageUnavailable(format!("Entry error: {}", e)))?;
            let path = entry.path();
            if path.is_dir() && path.join(JOURNAL_FILE).exists() {
                if let Some(user_id) = path.file_name().and_then(|n| n.to_str()).and_then(decode_id) {
                    users.push(user_id);
                }
            }
        }

        users.sort();
        Ok(users)
    }
}

impl Notifier for NotificationJournal {
    fn notify(&self, user_id: &str, notification: Notification) {
        if let Err(e) = self.append(user_id, &notification, Utc::now()) {
            tracing::error!(user_id, event = notification.name(), "Journal write failed: {}", e);
        }
    }
}
