//! Decoy identifiers and lifecycle states.
//!
//! The string forms are the wire format of the shared state file, so they must
//! stay stable: `shell`, `dns`, `ftp`, `smb`, `web` for decoys and lowercase
//! names for states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SnareError;

/// One emulated network service presented to attackers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoyKind {
    /// Remote shell (Windows command prompt emulation)
    Shell,
    /// Name resolution
    Dns,
    /// File transfer
    Ftp,
    /// File sharing
    Smb,
    /// Web application
    Web,
}

impl DecoyKind {
    pub const ALL: [DecoyKind; 5] = [
        DecoyKind::Shell,
        DecoyKind::Dns,
        DecoyKind::Ftp,
        DecoyKind::Smb,
        DecoyKind::Web,
    ];

    /// Key used for the decoy in the state file and in log file names
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoyKind::Shell => "shell",
            DecoyKind::Dns => "dns",
            DecoyKind::Ftp => "ftp",
            DecoyKind::Smb => "smb",
            DecoyKind::Web => "web",
        }
    }

    /// Key holding operator intent in the state file
    pub fn desired_key(&self) -> String {
        format!("{}_desired", self.as_str())
    }

    /// Human-facing label for log lines
    pub fn label(&self) -> &'static str {
        match self {
            DecoyKind::Shell => "Shell",
            DecoyKind::Dns => "DNS",
            DecoyKind::Ftp => "FTP",
            DecoyKind::Smb => "SMB",
            DecoyKind::Web => "Web",
        }
    }
}

impl fmt::Display for DecoyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecoyKind {
    type Err = SnareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shell" | "ssh" => Ok(DecoyKind::Shell),
            "dns" => Ok(DecoyKind::Dns),
            "ftp" => Ok(DecoyKind::Ftp),
            "smb" => Ok(DecoyKind::Smb),
            "web" | "http" => Ok(DecoyKind::Web),
            _ => Err(SnareError::UnknownDecoy(s.to_string())),
        }
    }
}

/// Operator intent for a decoy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
        }
    }

    /// Lenient parse used when reading the shared state file
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" | "start" | "started" => Some(DesiredState::Running),
            "stopped" | "stop" => Some(DesiredState::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed status of a decoy, owned by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualState {
    Running,
    Stopped,
    /// `start` is in flight
    Starting,
    Error,
    #[default]
    Unknown,
}

impl ActualState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualState::Running => "running",
            ActualState::Stopped => "stopped",
            ActualState::Starting => "starting",
            ActualState::Error => "error",
            ActualState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Some(ActualState::Running),
            "stopped" => Some(ActualState::Stopped),
            "starting" => Some(ActualState::Starting),
            "error" => Some(ActualState::Error),
            "unknown" => Some(ActualState::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ActualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
