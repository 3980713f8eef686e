//! Event sinks - append-only per-decoy activity record.
//!
//! Every decoy and the supervisor report through `EventSink::emit`. Sinks never
//! fail the caller: persistence problems are logged and dropped.

use snare_common::event_log;
use snare_common::DecoyKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub use snare_common::event_log::{EventLevel, EventRecord};

/// Destination for decoy activity
pub trait EventSink: Send + Sync {
    fn emit(&self, level: EventLevel, decoy: DecoyKind, message: &str);

    fn info(&self, decoy: DecoyKind, message: &str) {
        self.emit(EventLevel::Info, decoy, message);
    }

    fn warning(&self, decoy: DecoyKind, message: &str) {
        self.emit(EventLevel::Warning, decoy, message);
    }

    fn error(&self, decoy: DecoyKind, message: &str) {
        self.emit(EventLevel::Error, decoy, message);
    }
}

/// Sink handle passed into adapters and sessions
pub type SharedSink = Arc<dyn EventSink>;

/// Mirrors events into the process log
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, level: EventLevel, decoy: DecoyKind, message: &str) {
        match level {
            EventLevel::Info => info!(decoy = decoy.as_str(), "{}", message),
            EventLevel::Warning => warn!(decoy = decoy.as_str(), "{}", message),
            EventLevel::Error => error!(decoy = decoy.as_str(), "{}", message),
        }
    }
}

/// Appends JSON lines to `<log_dir>/<decoy>_honeypot.log`
pub struct JsonlEventSink {
    log_dir: PathBuf,
    /// One writer at a time so lines never interleave
    lock: Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, level: EventLevel, decoy: DecoyKind, message: &str) {
        let record = EventRecord::new(level, decoy, message);
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = event_log::append(&self.log_dir, &record) {
            warn!("Failed to persist {} event: {}", decoy, e);
        }
    }
}

/// Forwards every event to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, level: EventLevel, decoy: DecoyKind, message: &str) {
        for sink in &self.sinks {
            sink.emit(level, decoy, message);
        }
    }
}

/// Keeps events in memory; used by tests and diagnostics
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(EventLevel, DecoyKind, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(EventLevel, DecoyKind, String)> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Messages for one decoy at one level
    pub fn messages(&self, level: EventLevel, decoy: DecoyKind) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(l, d, _)| *l == level && *d == decoy)
            .map(|(_, _, m)| m)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|(_, _, m)| m.contains(needle))
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, level: EventLevel, decoy: DecoyKind, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((level, decoy, message.to_string()));
    }
}
