//! Desired-state store shared by the supervisor and the control surface.
//!
//! The on-disk form is a flat JSON object:
//!
//! ```json
//! { "shell_desired": "running", "shell": "running", "dns_desired": "stopped", "dns": "stopped" }
//! ```
//!
//! The control surface owns `<decoy>_desired`, the supervisor owns `<decoy>`.
//! Reads never fail: a missing, unreadable or corrupt file yields defaults.
//! Writes replace the whole file atomically, last writer wins.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::decoy::{ActualState, DecoyKind, DesiredState};
use crate::error::SnareError;

/// Default location of the shared state file
pub const STATE_FILE: &str = "/var/lib/snare/service_status.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Atomic File Operations
// ============================================================================

/// Write data to a file atomically using temp file + rename
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    // Unique per writer so concurrent writers never share a temp file
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), seq));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

// ============================================================================
// Record
// ============================================================================

/// Desired and actual state of one decoy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoyEntry {
    pub desired: DesiredState,
    pub actual: ActualState,
}

/// Snapshot of the shared state file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DesiredStateRecord {
    entries: BTreeMap<DecoyKind, DecoyEntry>,
    /// Keys this crate does not own, carried through rewrites untouched
    extra: Map<String, Value>,
}

impl DesiredStateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for a decoy, defaulted (running/unknown) if absent
    pub fn entry(&self, kind: DecoyKind) -> DecoyEntry {
        self.entries.get(&kind).copied().unwrap_or_default()
    }

    pub fn desired(&self, kind: DecoyKind) -> DesiredState {
        self.entry(kind).desired
    }

    pub fn actual(&self, kind: DecoyKind) -> ActualState {
        self.entry(kind).actual
    }

    pub fn set_desired(&mut self, kind: DecoyKind, desired: DesiredState) {
        self.entries.entry(kind).or_default().desired = desired;
    }

    pub fn set_actual(&mut self, kind: DecoyKind, actual: ActualState) {
        self.entries.entry(kind).or_default().actual = actual;
    }

    /// Build a record from parsed JSON, defaulting anything malformed
    pub fn from_json_value(value: &Value) -> Self {
        let mut record = Self::default();
        let Some(object) = value.as_object() else {
            return record;
        };

        let owned: Vec<String> = DecoyKind::ALL
            .iter()
            .flat_map(|k| [k.as_str().to_string(), k.desired_key()])
            .collect();

        for kind in DecoyKind::ALL {
            let mut entry = DecoyEntry::default();
            if let Some(desired) = object
                .get(&kind.desired_key())
                .and_then(Value::as_str)
                .and_then(DesiredState::parse)
            {
                entry.desired = desired;
            }
            if let Some(actual) = object
                .get(kind.as_str())
                .and_then(Value::as_str)
                .and_then(ActualState::parse)
            {
                entry.actual = actual;
            }
            record.entries.insert(kind, entry);
        }

        for (key, value) in object {
            if !owned.contains(key) {
                record.extra.insert(key.clone(), value.clone());
            }
        }

        record
    }

    /// Flat JSON form, always listing every decoy
    pub fn to_json_value(&self) -> Value {
        let mut object = self.extra.clone();
        for kind in DecoyKind::ALL {
            let entry = self.entry(kind);
            object.insert(
                kind.desired_key(),
                Value::String(entry.desired.as_str().to_string()),
            );
            object.insert(
                kind.as_str().to_string(),
                Value::String(entry.actual.as_str().to_string()),
            );
        }
        Value::Object(object)
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Persistence for the desired-state record
pub trait StateStore: Send + Sync {
    /// Current record; never fails
    fn read(&self) -> DesiredStateRecord;

    /// Replace the whole record
    fn write(&self, record: &DesiredStateRecord) -> Result<(), SnareError>;

    /// Read-modify-write in one step
    fn update(
        &self,
        apply: &mut dyn FnMut(&mut DesiredStateRecord),
    ) -> Result<DesiredStateRecord, SnareError> {
        let mut record = self.read();
        apply(&mut record);
        self.write(&record)?;
        Ok(record)
    }

    /// Supervisor-side write of a decoy's observed status
    fn set_actual(&self, kind: DecoyKind, actual: ActualState) -> Result<(), SnareError> {
        self.update(&mut |record: &mut DesiredStateRecord| record.set_actual(kind, actual))
            .map(|_| ())
    }

    /// Control-surface write of operator intent
    fn set_desired(&self, kind: DecoyKind, desired: DesiredState) -> Result<(), SnareError> {
        self.update(&mut |record: &mut DesiredStateRecord| record.set_desired(kind, desired))
            .map(|_| ())
    }
}

/// JSON file backed store
pub struct FileStateStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles inside this process
    lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Default location
    pub fn default_path() -> PathBuf {
        PathBuf::from(STATE_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record without creating a missing file
    pub fn peek(&self) -> DesiredStateRecord {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.load().unwrap_or_default()
    }

    /// `None` only when the file does not exist
    fn load(&self) -> Option<DesiredStateRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("State file {} unreadable: {}", self.path.display(), e);
                return Some(DesiredStateRecord::default());
            }
        };

        Some(match serde_json::from_str::<Value>(&content) {
            Ok(value) => DesiredStateRecord::from_json_value(&value),
            Err(e) => {
                warn!("State file {} is corrupt, using defaults: {}", self.path.display(), e);
                DesiredStateRecord::default()
            }
        })
    }

    fn read_unlocked(&self) -> DesiredStateRecord {
        if let Some(record) = self.load() {
            return record;
        }
        let record = DesiredStateRecord::default();
        // First read creates the file so operators can see and edit it
        if let Err(e) = self.write_unlocked(&record) {
            debug!("Could not create state file {}: {}", self.path.display(), e);
        }
        record
    }

    fn write_unlocked(&self, record: &DesiredStateRecord) -> Result<(), SnareError> {
        let data = serde_json::to_vec_pretty(&record.to_json_value())?;
        atomic_write(&self.path, &data)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> DesiredStateRecord {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read_unlocked()
    }

    fn write(&self, record: &DesiredStateRecord) -> Result<(), SnareError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.write_unlocked(record)
    }

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut DesiredStateRecord),
    ) -> Result<DesiredStateRecord, SnareError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut record = self.read_unlocked();
        apply(&mut record);
        self.write_unlocked(&record)?;
        Ok(record)
    }
}

/// In-process store, used when the control surface shares the process and in tests
#[derive(Default)]
pub struct MemoryStateStore {
    record: Mutex<DesiredStateRecord>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: DesiredStateRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self) -> DesiredStateRecord {
        self.record
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn write(&self, record: &DesiredStateRecord) -> Result<(), SnareError> {
        *self.record.lock().unwrap_or_else(|p| p.into_inner()) = record.clone();
        Ok(())
    }

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut DesiredStateRecord),
    ) -> Result<DesiredStateRecord, SnareError> {
        let mut guard = self.record.lock().unwrap_or_else(|p| p.into_inner());
        apply(&mut *guard);
        Ok(guard.clone())
    }
}
