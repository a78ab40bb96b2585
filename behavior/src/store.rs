//! Persistence seams
//!
//! [`DocumentStore`] holds per-user documents: registered devices, current
//! fixes, the zone layout, the behaviour log, device patterns and the
//! training state. [`ArtifactStore`] holds opaque serialized models.

use crate::recorder::{BehaviorRecord, DevicePattern, PriorPosition};
use crate::training::TrainingState;
use crate::{Result, TrackerError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tandem_geo::{DeviceFix, ZoneLayout};

/// Document storage for tracker state
pub trait DocumentStore: Send + Sync {
    /// Register a device for a user; returns the user's device count
    fn register_device(&self, user_id: &str, device_id: &str) -> Result<usize>;
    /// Registered devices in registration order
    fn devices(&self, user_id: &str) -> Result<Vec<String>>;

    fn current_fix(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceFix>>;
    fn upsert_fix(&self, user_id: &str, fix: &DeviceFix) -> Result<()>;

    fn layout(&self, user_id: &str) -> Result<Option<ZoneLayout>>;
    /// Store the layout unless one exists; returns whichever layout is stored
    fn insert_layout_if_absent(&self, user_id: &str, layout: ZoneLayout) -> Result<ZoneLayout>;

    fn append_behavior(&self, record: &BehaviorRecord) -> Result<()>;
    /// Up to `limit` most recent records, oldest first
    fn recent_behavior(&self, user_id: &str, limit: usize) -> Result<Vec<BehaviorRecord>>;
    /// Records stamped at or after `since`, oldest first
    fn behavior_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<BehaviorRecord>>;
    fn behavior_count(&self, user_id: &str) -> Result<usize>;
    /// Most recent recorded position of a device in the behaviour log
    fn last_position(&self, user_id: &str, device_id: &str) -> Result<Option<PriorPosition>>;

    fn pattern(&self, user_id: &str, device_id: &str) -> Result<Option<DevicePattern>>;
    fn patterns(&self, user_id: &str) -> Result<Vec<DevicePattern>>;
    /// Apply `update` to a device's pattern, creating it first if absent.
    /// Runs atomically with respect to other writers of the same user.
    fn update_pattern(
        &self,
        user_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut DevicePattern),
    ) -> Result<DevicePattern>;

    fn training_state(&self, user_id: &str) -> Result<Option<TrainingState>>;
    fn upsert_training_state(&self, state: &TrainingState) -> Result<()>;
}

/// Blob storage for trained models, keyed by user
pub trait ArtifactStore: Send + Sync {
    fn write(&self, user_id: &str, bytes: &[u8]) -> Result<()>;
    fn read(&self, user_id: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, user_id: &str) -> Result<()>;
}

#[derive(Default)]
struct UserDocuments {
    devices: Vec<String>,
    fixes: HashMap<String, DeviceFix>,
    layout: Option<ZoneLayout>,
    behavior: Vec<BehaviorRecord>,
    patterns: HashMap<String, DevicePattern>,
    training: Option<TrainingState>,
}

/// In-memory document store
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserDocuments>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `StorageUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TrackerError::StorageUnavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn read_user<T>(&self, user_id: &str, f: impl FnOnce(Option<&UserDocuments>) -> T) -> Result<T> {
        self.check_online()?;
        let users = self
            .users
            .read()
            .map_err(|_| TrackerError::StorageUnavailable("store lock poisoned".to_string()))?;
        Ok(f(users.get(user_id)))
    }

    fn write_user<T>(&self, user_id: &str, f: impl FnOnce(&mut UserDocuments) -> T) -> Result<T> {
        self.check_online()?;
        let mut users = self
            .users
            .write()
            .map_err(|_| TrackerError::StorageUnavailable("store lock poisoned".to_string()))?;
        Ok(f(users.entry(user_id.to_string()).or_default()))
    }
}

impl DocumentStore for MemoryStore {
    fn register_device(&self, user_id: &str, device_id: &str) -> Result<usize> {
        self.write_user(user_id, |docs| {
            if !docs.devices.iter().any(|d| d == device_id) {
                docs.devices.push(device_id.to_string());
            }
            docs.devices.len()
        })
    }

    fn devices(&self, user_id: &str) -> Result<Vec<String>> {
        self.read_user(user_id, |docs| docs.map(|d| d.devices.clone()).unwrap_or_default())
    }

    fn current_fix(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceFix>> {
        self.read_user(user_id, |docs| docs.and_then(|d| d.fixes.get(device_id).cloned()))
    }

    fn upsert_fix(&self, user_id: &str, fix: &DeviceFix) -> Result<()> {
        self.write_user(user_id, |docs| {
            docs.fixes.insert(fix.device_id.clone(), fix.clone());
        })
    }

    fn layout(&self, user_id: &str) -> Result<Option<ZoneLayout>> {
        self.read_user(user_id, |docs| docs.and_then(|d| d.layout.clone()))
    }

    fn insert_layout_if_absent(&self, user_id: &str, layout: ZoneLayout) -> Result<ZoneLayout> {
        self.write_user(user_id, |docs| docs.layout.get_or_insert(layout).clone())
    }

    fn append_behavior(&self, record: &BehaviorRecord) -> Result<()> {
        self.write_user(&record.user_id, |docs| docs.behavior.push(record.clone()))
    }

    fn recent_behavior(&self, user_id: &str, limit: usize) -> Result<Vec<BehaviorRecord>> {
        self.read_user(user_id, |docs| {
            docs.map(|d| {
                let skip = d.behavior.len().saturating_sub(limit);
                d.behavior[skip..].to_vec()
            })
            .unwrap_or_default()
        })
    }

    fn behavior_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<BehaviorRecord>> {
        self.read_user(user_id, |docs| {
            docs.map(|d| d.behavior.iter().filter(|r| r.timestamp >= since).cloned().collect())
                .unwrap_or_default()
        })
    }

    fn behavior_count(&self, user_id: &str) -> Result<usize> {
        self.read_user(user_id, |docs| docs.map(|d| d.behavior.len()).unwrap_or(0))
    }

    fn last_position(&self, user_id: &str, device_id: &str) -> Result<Option<PriorPosition>> {
        self.read_user(user_id, |docs| {
            docs.and_then(|d| {
                d.behavior.iter().rev().find_map(|r| r.prior_of(device_id))
            })
        })
    }

    fn pattern(&self, user_id: &str, device_id: &str) -> Result<Option<DevicePattern>> {
        self.read_user(user_id, |docs| docs.and_then(|d| d.patterns.get(device_id).cloned()))
    }

    fn patterns(&self, user_id: &str) -> Result<Vec<DevicePattern>> {
        self.read_user(user_id, |docs| {
            let Some(docs) = docs else {
                return Vec::new();
            };
            // Registration order, then any stragglers by id
            let mut out: Vec<DevicePattern> = docs
                .devices
                .iter()
                .filter_map(|id| docs.patterns.get(id).cloned())
                .collect();
            let mut rest: Vec<DevicePattern> = docs
                .patterns
                .values()
                .filter(|p| !docs.devices.contains(&p.device_id))
                .cloned()
                .collect();
            rest.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            out.extend(rest);
            out
        })
    }

    fn update_pattern(
        &self,
        user_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut DevicePattern),
    ) -> Result<DevicePattern> {
        self.write_user(user_id, |docs| {
            let pattern = docs
                .patterns
                .entry(device_id.to_string())
                .or_insert_with(|| DevicePattern::new(user_id, device_id, now));
            update(pattern);
            pattern.clone()
        })
    }

    fn training_state(&self, user_id: &str) -> Result<Option<TrainingState>> {
        self.read_user(user_id, |docs| docs.and_then(|d| d.training.clone()))
    }

    fn upsert_training_state(&self, state: &TrainingState) -> Result<()> {
        self.write_user(&state.user_id, |docs| docs.training = Some(state.clone()))
    }
}

/// In-memory artifact store
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn write(&self, user_id: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| TrackerError::StorageUnavailable("artifact lock poisoned".to_string()))?;
        blobs.insert(user_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| TrackerError::StorageUnavailable("artifact lock poisoned".to_string()))?;
        Ok(blobs.get(user_id).cloned())
    }

    fn delete(&self, user_id: &str) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| TrackerError::StorageUnavailable("artifact lock poisoned".to_string()))?;
        blobs.remove(user_id);
        Ok(())
    }
}

/// Artifacts as `<dir>/<user>.model.json` files
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            TrackerError::StorageUnavailable(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.model.json", encode_id(user_id)))
    }
}

impl ArtifactStore for FileArtifactStore {
    fn write(&self, user_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, bytes)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| TrackerError::StorageUnavailable(format!("Failed to write {}: {}", path.display(), e)))?;

        tracing::debug!("Wrote model artifact {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    fn read(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(user_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TrackerError::StorageUnavailable(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn delete(&self, user_id: &str) -> Result<()> {
        let path = self.path_for(user_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TrackerError::StorageUnavailable(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Encode an id as a single path component.
///
/// ASCII alphanumerics, `-` and `_` pass through, every other byte becomes
/// `%XX`. Distinct ids always map to distinct names; the empty id is `%`.
pub(crate) fn encode_id(id: &str) -> String {
    if id.is_empty() {
        return "%".to_string();
    }

    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Inverse of [`encode_id`]; `None` on a malformed escape
pub(crate) fn decode_id(name: &str) -> Option<String> {
    if name == "%" {
        return Some(String::new());
    }

    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
