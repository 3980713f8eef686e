//! Command execution, kept separate from argument parsing and printing.
//!
//! The control surface only ever writes `<decoy>_desired`; the daemon owns the
//! bare `<decoy>` status keys.

use anyhow::{bail, Context, Result};
use snare_common::config::{EventsConfig, CONFIG_PATH};
use snare_common::event_log::{self, EventLevel, EventRecord};
use snare_common::{
    ActualState, Config, DecoyKind, DesiredState, DesiredStateRecord, FileStateStore, StateStore,
};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::cli::{Cli, Commands};
use crate::output;

/// One line of `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub decoy: DecoyKind,
    pub enabled: bool,
    pub desired: DesiredState,
    pub actual: ActualState,
}

impl StatusRow {
    /// Desired and actual disagree and the daemon is not mid-transition
    pub fn diverged(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match (self.desired, self.actual) {
            (DesiredState::Running, ActualState::Running) => false,
            (DesiredState::Stopped, ActualState::Stopped) => false,
            (_, ActualState::Starting) => false,
            _ => true,
        }
    }
}

pub fn status_rows(record: &DesiredStateRecord, config: &Config) -> Vec<StatusRow> {
    DecoyKind::ALL
        .iter()
        .map(|&decoy| StatusRow {
            decoy,
            enabled: config.services.is_enabled(decoy),
            desired: record.desired(decoy),
            actual: record.actual(decoy),
        })
        .collect()
}

/// Record operator intent and note it in the decoy's activity log
pub fn set_intent(
    store: &dyn StateStore,
    events: &EventsConfig,
    decoy: DecoyKind,
    desired: DesiredState,
) -> Result<()> {
    store
        .set_desired(decoy, desired)
        .with_context(|| format!("Failed to record desired state for {}", decoy))?;

    if events.jsonl {
        let verb = match desired {
            DesiredState::Running => "started",
            DesiredState::Stopped => "stopped",
        };
        let record = EventRecord::new(
            EventLevel::Info,
            decoy,
            &format!("{} decoy {} by operator", decoy.label(), verb),
        );
        // The intent is already stored; a missing log line is not fatal
        if let Err(e) = event_log::append(&events.log_dir, &record) {
            warn!("Failed to append operator event: {}", e);
        }
    }
    Ok(())
}

/// Last `count` events for a decoy, oldest first
pub fn recent_events(log_dir: &Path, decoy: DecoyKind, count: usize) -> Result<Vec<EventRecord>> {
    let mut records = event_log::read_all(log_dir, decoy)
        .with_context(|| format!("Failed to read {} activity log", decoy))?;
    let skip = records.len().saturating_sub(count);
    Ok(records.split_off(skip))
}

/// Write the default configuration; refuses to clobber unless forced
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::save_default(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn parse_decoy(name: &str) -> Result<DecoyKind> {
    name.parse::<DecoyKind>()
        .with_context(|| "Expected one of: shell, dns, ftp, smb, web".to_string())
}

fn open_store(config: &Config, state_file: Option<PathBuf>) -> FileStateStore {
    FileStateStore::new(state_file.unwrap_or_else(|| config.supervisor.state_file.clone()))
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::InitConfig { path, force } = &cli.command {
        let path = path.clone().unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
        init_config(&path, *force)?;
        output::success(&format!("Default configuration written to {}", path.display()));
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref());
    let store = open_store(&config, cli.state_file);

    match cli.command {
        Commands::Status { json } => {
            // Status may run as a user who cannot write the state file
            let record = store.peek();
            if json {
                println!("{}", serde_json::to_string_pretty(&record.to_json_value())?);
            } else {
                output::status_table(&status_rows(&record, &config));
            }
        }
        Commands::Start { decoy } => {
            let kind = parse_decoy(&decoy)?;
            set_intent(&store, &config.events, kind, DesiredState::Running)?;
            if !config.services.is_enabled(kind) {
                output::warning(&format!(
                    "{} decoy is disabled in the configuration; the daemon will not start it",
                    kind.label()
                ));
            }
            output::success(&format!("{} decoy requested to start", kind.label()));
        }
        Commands::Stop { decoy } => {
            let kind = parse_decoy(&decoy)?;
            set_intent(&store, &config.events, kind, DesiredState::Stopped)?;
            output::success(&format!("{} decoy requested to stop", kind.label()));
        }
        Commands::Logs { decoy, lines } => {
            let kind = parse_decoy(&decoy)?;
            let events = recent_events(&config.events.log_dir, kind, lines)?;
            if events.is_empty() {
                output::info(&format!("No activity recorded for {}", kind.label()));
            }
            for event in &events {
                output::event_line(event);
            }
        }
        // Handled before the config is loaded
        Commands::InitConfig { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snare_common::MemoryStateStore;
    use tempfile::TempDir;

    fn events_in(dir: &TempDir) -> EventsConfig {
        EventsConfig {
            log_dir: dir.path().to_path_buf(),
            jsonl: true,
        }
    }

    #[test]
    fn test_set_intent_writes_desired_only() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStateStore::new();
        store.set_actual(DecoyKind::Ftp, ActualState::Running).unwrap();

        set_intent(&store, &events_in(&dir), DecoyKind::Ftp, DesiredState::Stopped).unwrap();

        let record = store.read();
        assert_eq!(record.desired(DecoyKind::Ftp), DesiredState::Stopped);
        assert_eq!(record.actual(DecoyKind::Ftp), ActualState::Running);

        let log = event_log::read_all(dir.path(), DecoyKind::Ftp).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "FTP decoy stopped by operator");
    }

    #[test]
    fn test_set_intent_without_jsonl_skips_log() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStateStore::new();
        let events = EventsConfig {
            jsonl: false,
            ..events_in(&dir)
        };
        set_intent(&store, &events, DecoyKind::Web, DesiredState::Running).unwrap();
        assert!(event_log::read_all(dir.path(), DecoyKind::Web).unwrap().is_empty());
    }

    #[test]
    fn test_status_rows_and_divergence() {
        let mut record = DesiredStateRecord::default();
        record.set_actual(DecoyKind::Shell, ActualState::Running);
        record.set_desired(DecoyKind::Dns, DesiredState::Stopped);
        record.set_actual(DecoyKind::Dns, ActualState::Running);
        record.set_actual(DecoyKind::Ftp, ActualState::Starting);

        let mut config = Config::default();
        config.services.web.enabled = false;

        let rows = status_rows(&record, &config);
        assert_eq!(rows.len(), 5);
        assert!(!rows[0].diverged());
        assert!(rows[1].diverged());
        assert!(!rows[2].diverged());
        assert!(rows[3].diverged());
        assert!(!rows[4].enabled);
        assert!(!rows[4].diverged());
    }

    #[test]
    fn test_recent_events_tail() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            let record = EventRecord::new(EventLevel::Info, DecoyKind::Smb, &format!("event {}", i));
            event_log::append(dir.path(), &record).unwrap();
        }
        let tail = recent_events(dir.path(), DecoyKind::Smb, 2).unwrap();
        let messages: Vec<_> = tail.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["event 3", "event 4"]);
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snare").join("config.toml");
        init_config(&path, false).unwrap();
        assert!(Config::load_from_path(&path).is_ok());
        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }

    #[test]
    fn test_parse_decoy_aliases() {
        assert_eq!(parse_decoy("SSH").unwrap(), DecoyKind::Shell);
        assert!(parse_decoy("telnet").is_err());
    }
}
