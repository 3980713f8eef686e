//! Per-decoy activity log - one JSON object per line.
//!
//! Files live at `<log_dir>/<decoy>_honeypot.log`. The daemon appends through
//! its event sink; `snarectl` appends operator actions and reads them back.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::decoy::DecoyKind;

/// Event severity level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
        }
    }
}

/// Single persisted line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub timestamp: String,
    pub level: EventLevel,
    pub service: DecoyKind,
    pub message: String,
}

impl EventRecord {
    pub fn new(level: EventLevel, decoy: DecoyKind, message: &str) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            level,
            service: decoy,
            message: message.to_string(),
        }
    }
}

/// Log file for a decoy
pub fn log_path(log_dir: &Path, decoy: DecoyKind) -> PathBuf {
    log_dir.join(format!("{}_honeypot.log", decoy.as_str()))
}

/// Append one record, creating the directory if needed
pub fn append(log_dir: &Path, record: &EventRecord) -> std::io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(log_dir, record.service))?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{}", line)
}

/// Every record for a decoy, skipping lines that do not parse
pub fn read_all(log_dir: &Path, decoy: DecoyKind) -> std::io::Result<Vec<EventRecord>> {
    let path = log_path(log_dir, decoy);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_wire_format() {
        let record = EventRecord::new(EventLevel::Warning, DecoyKind::Ftp, "x");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["level"], "WARNING");
        assert_eq!(json["service"], "ftp");
        assert_eq!(json["message"], "x");
        assert_eq!(json["timestamp"].as_str().unwrap().len(), 19);
    }

    #[test]
    fn test_read_skips_garbage_lines() {
        let temp_dir = TempDir::new().unwrap();
        let record = EventRecord::new(EventLevel::Info, DecoyKind::Smb, "started by operator");
        append(temp_dir.path(), &record).unwrap();
        let path = log_path(temp_dir.path(), DecoyKind::Smb);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json").unwrap();
        append(temp_dir.path(), &record).unwrap();

        let records = read_all(temp_dir.path(), DecoyKind::Smb).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record);
        assert!(read_all(temp_dir.path(), DecoyKind::Web).unwrap().is_empty());
    }
}
