//! File-backed state store tests
//!
//! Covers the tolerance rules for the shared state file: missing and corrupt
//! files read as defaults, writes are whole-file replacements.

use snare_common::{
    ActualState, DecoyKind, DesiredState, DesiredStateRecord, FileStateStore, StateStore,
};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_missing_file_reads_defaults_and_creates_it() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("state").join("service_status.json");
    let store = FileStateStore::new(&path);

    let record = store.read();
    assert_eq!(record.desired(DecoyKind::Shell), DesiredState::Running);
    assert_eq!(record.actual(DecoyKind::Shell), ActualState::Unknown);
    assert!(path.exists());

    let on_disk: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["shell_desired"], "running");
    assert_eq!(on_disk["web"], "unknown");
}

#[test]
fn test_peek_leaves_missing_file_alone() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("service_status.json");
    let store = FileStateStore::new(&path);

    assert_eq!(store.peek(), DesiredStateRecord::default());
    assert!(!path.exists());

    store.set_desired(DecoyKind::Web, DesiredState::Stopped).unwrap();
    assert_eq!(store.peek().desired(DecoyKind::Web), DesiredState::Stopped);
}

#[test]
fn test_corrupt_file_reads_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("service_status.json");
    fs::write(&path, "{\"shell_desired\": \"stopp").unwrap();

    let store = FileStateStore::new(&path);
    assert_eq!(store.read(), DesiredStateRecord::default());
}

#[test]
fn test_write_then_read() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStateStore::new(temp_dir.path().join("service_status.json"));

    let mut record = DesiredStateRecord::new();
    record.set_desired(DecoyKind::Dns, DesiredState::Stopped);
    record.set_actual(DecoyKind::Dns, ActualState::Error);
    store.write(&record).unwrap();

    let loaded = store.read();
    assert_eq!(loaded.desired(DecoyKind::Dns), DesiredState::Stopped);
    assert_eq!(loaded.actual(DecoyKind::Dns), ActualState::Error);
    assert_eq!(loaded.desired(DecoyKind::Ftp), DesiredState::Running);
}

#[test]
fn test_partial_file_from_older_control_surface() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("service_status.json");
    fs::write(&path, r#"{"smb_desired": "stopped"}"#).unwrap();

    let store = FileStateStore::new(&path);
    let record = store.read();
    assert_eq!(record.desired(DecoyKind::Smb), DesiredState::Stopped);
    assert_eq!(record.actual(DecoyKind::Smb), ActualState::Unknown);
}

#[test]
fn test_set_actual_preserves_operator_intent() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStateStore::new(temp_dir.path().join("service_status.json"));

    store.set_desired(DecoyKind::Ftp, DesiredState::Stopped).unwrap();
    store.set_actual(DecoyKind::Ftp, ActualState::Stopped).unwrap();

    let record = store.read();
    assert_eq!(record.desired(DecoyKind::Ftp), DesiredState::Stopped);
    assert_eq!(record.actual(DecoyKind::Ftp), ActualState::Stopped);

    // No temp files left behind
    let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
        .collect();
    assert!(leftovers.is_empty());
}
