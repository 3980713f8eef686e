//! Configuration management for snare.
//!
//! Loads settings from an explicit path, then /etc/snare/config.toml, or uses
//! defaults. Every field carries a serde default so partial files are fine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::decoy::DecoyKind;
use crate::error::SnareError;
use crate::state_store::STATE_FILE;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/snare/config.toml";

/// Identities used when the shell decoy has no configured users
pub const FALLBACK_IDENTITIES: [&str; 5] = ["Administrator", "Guest", "Default", "John", "Alice"];

/// Login pair accepted by a decoy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

fn default_users() -> Vec<Credential> {
    vec![
        Credential::new("Administrator", "P@ssw0rd2019"),
        Credential::new("Guest", "guest"),
        Credential::new("John", "Summer2024!"),
        Credential::new("Alice", "alice123"),
    ]
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Supervisor / events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Reconciliation poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Grace period for an adapter to finish after stop, in milliseconds
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,

    /// Shared desired-state file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_stop_grace() -> u64 {
    5_000
}

fn default_state_file() -> PathBuf {
    PathBuf::from(STATE_FILE)
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stop_grace_ms: default_stop_grace(),
            state_file: default_state_file(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Directory holding per-decoy `<decoy>_honeypot.log` files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Persist events as JSON lines in addition to tracing output
    #[serde(default = "default_true")]
    pub jsonl: bool,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/snare")
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            jsonl: true,
        }
    }
}

// ============================================================================
// Decoys
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_shell_port")]
    pub port: u16,
    /// Name reported by `hostname`
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Prefix reported by `whoami`
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_shell_idle")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_login_attempts")]
    pub max_login_attempts: u32,
    #[serde(default = "default_users")]
    pub users: Vec<Credential>,
    /// OpenSSH private key; a fresh ed25519 key is generated per run when unset
    #[serde(default)]
    pub host_key: Option<PathBuf>,
}

fn default_shell_port() -> u16 {
    2222
}

fn default_hostname() -> String {
    "DC01".to_string()
}

fn default_domain() -> String {
    "domain".to_string()
}

fn default_shell_idle() -> u64 {
    300
}

fn default_login_attempts() -> u32 {
    3
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_shell_port(),
            hostname: default_hostname(),
            domain: default_domain(),
            idle_timeout_secs: default_shell_idle(),
            max_login_attempts: default_login_attempts(),
            users: default_users(),
            host_key: None,
        }
    }
}

impl ShellConfig {
    /// Identities known to the emulated host
    pub fn identities(&self) -> Vec<String> {
        if self.users.is_empty() {
            FALLBACK_IDENTITIES.iter().map(|s| s.to_string()).collect()
        } else {
            self.users.iter().map(|u| u.username.clone()).collect()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default = "default_dns_ttl")]
    pub ttl: u32,
    /// Subdomain label → IPv4 address
    #[serde(default = "default_dns_records")]
    pub records: BTreeMap<String, String>,
}

fn default_dns_port() -> u16 {
    5353
}

fn default_dns_ttl() -> u32 {
    60
}

fn default_dns_records() -> BTreeMap<String, String> {
    [
        ("www", "192.168.1.10"),
        ("mail", "192.168.1.20"),
        ("dc01", "192.168.1.100"),
        ("vpn", "192.168.1.30"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_dns_port(),
            ttl: default_dns_ttl(),
            records: default_dns_records(),
        }
    }
}

impl DnsConfig {
    /// Parsed record table, keyed by lowercase label
    pub fn parsed_records(&self) -> Result<HashMap<String, Ipv4Addr>, SnareError> {
        self.records
            .iter()
            .map(|(name, addr)| {
                addr.parse::<Ipv4Addr>()
                    .map(|ip| (name.to_ascii_lowercase(), ip))
                    .map_err(|_| {
                        SnareError::InvalidConfig(format!(
                            "dns record '{}' has invalid IPv4 address '{}'",
                            name, addr
                        ))
                    })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    #[serde(default = "default_ftp_banner")]
    pub banner: String,
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    #[serde(default = "default_users")]
    pub users: Vec<Credential>,
    #[serde(default = "default_fake_files")]
    pub fake_files: Vec<String>,
}

fn default_ftp_port() -> u16 {
    2121
}

fn default_ftp_banner() -> String {
    "220 Microsoft FTP Service".to_string()
}

fn default_fake_files() -> Vec<String> {
    vec![
        "backup_2024.zip".to_string(),
        "passwords.txt".to_string(),
        "finance_q3.xlsx".to_string(),
    ]
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_ftp_port(),
            banner: default_ftp_banner(),
            allow_anonymous: true,
            users: default_users(),
            fake_files: default_fake_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmbConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_smb_port")]
    pub port: u16,
    #[serde(default = "default_smb_idle")]
    pub idle_timeout_secs: u64,
    /// NetBIOS name offered in the NTLM challenge
    #[serde(default = "default_smb_server_name")]
    pub server_name: String,
    #[serde(default = "default_smb_domain")]
    pub domain: String,
    #[serde(default = "default_shares")]
    pub shares: Vec<ShareConfig>,
}

fn default_smb_port() -> u16 {
    4445
}

fn default_smb_idle() -> u64 {
    120
}

fn default_smb_server_name() -> String {
    "FS01".to_string()
}

fn default_smb_domain() -> String {
    "CONTOSO".to_string()
}

fn default_shares() -> Vec<ShareConfig> {
    vec![
        ShareConfig {
            name: "Finance".to_string(),
            files: vec!["payroll_2024.xlsx".to_string(), "invoices.pdf".to_string()],
        },
        ShareConfig {
            name: "IT".to_string(),
            files: vec!["network_diagram.vsdx".to_string(), "admin_passwords.txt".to_string()],
        },
    ]
}

impl Default for SmbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_smb_port(),
            idle_timeout_secs: default_smb_idle(),
            server_name: default_smb_server_name(),
            domain: default_smb_domain(),
            shares: default_shares(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Application name shown on the login page
    #[serde(default = "default_web_title")]
    pub title: String,
}

fn default_web_port() -> u16 {
    8080
}

fn default_web_title() -> String {
    "Contoso Production Management".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_web_port(),
            title: default_web_title(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub ftp: FtpConfig,
    #[serde(default)]
    pub smb: SmbConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl ServicesConfig {
    pub fn is_enabled(&self, kind: DecoyKind) -> bool {
        match kind {
            DecoyKind::Shell => self.shell.enabled,
            DecoyKind::Dns => self.dns.enabled,
            DecoyKind::Ftp => self.ftp.enabled,
            DecoyKind::Smb => self.smb.enabled,
            DecoyKind::Web => self.web.enabled,
        }
    }

    pub fn port(&self, kind: DecoyKind) -> u16 {
        match kind {
            DecoyKind::Shell => self.shell.port,
            DecoyKind::Dns => self.dns.port,
            DecoyKind::Ftp => self.ftp.port,
            DecoyKind::Smb => self.smb.port,
            DecoyKind::Web => self.web.port,
        }
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address every decoy binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub services: ServicesConfig,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            supervisor: SupervisorConfig::default(),
            events: EventsConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `path`, then the system path, or use defaults
    pub fn load(path: Option<&Path>) -> Self {
        let explicit = path.map(|p| {
            Self::load_from_path(p).map_err(|e| {
                warn!("Failed to load config {}: {}", p.display(), e);
                e
            })
        });

        match explicit {
            Some(Ok(config)) => config,
            _ => Self::load_from_path(Path::new(CONFIG_PATH)).unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            }),
        }
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self, SnareError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save default config to path (for init)
    pub fn save_default(path: &Path) -> Result<(), SnareError> {
        let content = toml::to_string_pretty(&Config::default())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        info!("Saved default config to {}", path.display());
        Ok(())
    }

    /// Decoys with `enabled = true`
    pub fn enabled_decoys(&self) -> Vec<DecoyKind> {
        DecoyKind::ALL
            .into_iter()
            .filter(|k| self.services.is_enabled(*k))
            .collect()
    }

    /// Reject configurations that cannot possibly start
    pub fn validate(&self) -> Result<(), SnareError> {
        let mut seen: HashMap<u16, DecoyKind> = HashMap::new();
        for kind in self.enabled_decoys() {
            let port = self.services.port(kind);
            // DNS is UDP and may share a number with a TCP decoy
            if kind == DecoyKind::Dns {
                continue;
            }
            if let Some(other) = seen.insert(port, kind) {
                return Err(SnareError::InvalidConfig(format!(
                    "{} and {} both use port {}",
                    other, kind, port
                )));
            }
        }

        if self.services.dns.enabled {
            self.services.dns.parsed_records()?;
        }

        if self.bind_address.parse::<std::net::IpAddr>().is_err() {
            return Err(SnareError::InvalidConfig(format!(
                "bind_address '{}' is not an IP address",
                self.bind_address
            )));
        }

        Ok(())
    }
}
