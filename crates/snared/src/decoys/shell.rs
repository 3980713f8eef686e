//! Shell decoy - SSH server in front of `ShellSession`.
//!
//! Clients authenticate with a password; every attempt is reported together
//! with the peer address and the password tried. A successful login gets a
//! Windows command prompt on the session channel, either interactively via
//! `shell` or one command at a time via `exec`.

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty, SshId};
use russh_keys::key::KeyPair;
use snare_common::config::{Credential, ShellConfig};
use snare_common::DecoyKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{spawn_serve, DecoyAdapter, DecoyError, DecoyTask, Lifecycle};
use crate::events::SharedSink;
use crate::shell::canned;
use crate::shell::{CommandOutcome, HostProfile, ShellSession};

/// Longest accepted input line
const MAX_LINE: usize = 4096;

/// Pause after a failed accept so a full fd table does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Delay before a rejected password is answered
const AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// Identification string sent before key exchange
const SERVER_ID: &str = "SSH-2.0-OpenSSH_for_Windows_8.1";

const KIND: DecoyKind = DecoyKind::Shell;

pub struct ShellDecoy {
    config: ShellConfig,
    addr: SocketAddr,
    lifecycle: Lifecycle,
}

impl ShellDecoy {
    pub fn new(config: ShellConfig, addr: SocketAddr) -> Self {
        Self {
            config,
            addr,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl DecoyAdapter for ShellDecoy {
    fn kind(&self) -> DecoyKind {
        KIND
    }

    async fn start(&self, sink: SharedSink) -> Result<DecoyTask, DecoyError> {
        let guard = self.lifecycle.begin(KIND)?;
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| DecoyError::Bind {
                addr: self.addr,
                source,
            })?;

        let settings = Arc::new(LoginSettings::from_config(&self.config));
        let ssh = Arc::new(ssh_config(&settings, host_key(&self.config)?));
        sink.info(KIND, &format!("Shell decoy listening on {}", self.addr));

        let token = guard.token();
        Ok(spawn_serve(
            guard,
            accept_loop(listener, ssh, settings, sink, token),
        ))
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

/// Everything a connection needs that does not change between connections
struct LoginSettings {
    profile: HostProfile,
    credentials: Vec<Credential>,
    idle_timeout: Duration,
    max_attempts: u32,
}

impl LoginSettings {
    fn from_config(config: &ShellConfig) -> Self {
        Self {
            profile: HostProfile {
                hostname: config.hostname.clone(),
                domain: config.domain.clone(),
                identities: config.identities(),
            },
            credentials: config.users.clone(),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
            max_attempts: config.max_login_attempts.max(1),
        }
    }

    /// Canonical identity for a credential pair.
    ///
    /// With no configured users, any password is accepted for the fallback
    /// identities so the decoy still has someone to log in as.
    fn authenticate(&self, username: &str, password: &str) -> Option<String> {
        if self.credentials.is_empty() {
            return self
                .profile
                .identities
                .iter()
                .find(|identity| identity.eq_ignore_ascii_case(username))
                .cloned();
        }
        self.credentials
            .iter()
            .find(|c| c.username.eq_ignore_ascii_case(username) && c.password == password)
            .map(|c| c.username.clone())
    }
}

fn host_key(config: &ShellConfig) -> Result<KeyPair, DecoyError> {
    match &config.host_key {
        Some(path) => russh_keys::load_secret_key(path, None).map_err(|e| {
            DecoyError::Config(format!("cannot load host key {}: {}", path.display(), e))
        }),
        None => KeyPair::generate_ed25519()
            .ok_or_else(|| DecoyError::Engine("host key generation failed".to_string())),
    }
}

fn ssh_config(settings: &LoginSettings, key: KeyPair) -> server::Config {
    server::Config {
        server_id: SshId::Standard(SERVER_ID.to_string()),
        methods: MethodSet::PASSWORD,
        auth_rejection_time: AUTH_REJECTION_DELAY,
        max_auth_attempts: settings.max_attempts as usize,
        inactivity_timeout: Some(settings.idle_timeout),
        keys: vec![key],
        ..Default::default()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ssh: Arc<server::Config>,
    settings: Arc<LoginSettings>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), DecoyError> {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                sink.info(KIND, "Shell decoy stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ssh = Arc::clone(&ssh);
                    let settings = Arc::clone(&settings);
                    let sink = Arc::clone(&sink);
                    let token = token.child_token();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, ssh, settings, sink, token).await;
                    });
                }
                Err(e) => {
                    warn!("Shell accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

// ============================================================================
// Line discipline
// ============================================================================

/// One completed unit of terminal input
#[derive(Debug, Clone, PartialEq, Eq)]
enum Edit {
    Line(String),
    /// Ctrl-C
    Interrupt,
    /// Ctrl-D on an empty line
    EndOfInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Escape {
    #[default]
    None,
    Started,
    Csi,
}

/// Cooked-mode line editing over raw channel bytes
#[derive(Debug, Default)]
struct LineEditor {
    line: Vec<u8>,
    /// Echo typed bytes back; only when the client asked for a pty
    echo: bool,
    skip_lf: bool,
    escape: Escape,
}

impl LineEditor {
    /// Consume input, returning bytes to echo and the edits it completed
    fn feed(&mut self, data: &[u8]) -> (Vec<u8>, Vec<Edit>) {
        let mut echo = Vec::new();
        let mut edits = Vec::new();

        for &byte in data {
            // Arrow keys and friends are swallowed whole
            match self.escape {
                Escape::Started => {
                    self.escape = if byte == b'[' { Escape::Csi } else { Escape::None };
                    continue;
                }
                Escape::Csi => {
                    if (0x40..=0x7E).contains(&byte) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            let after_cr = std::mem::take(&mut self.skip_lf);
            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    self.skip_lf = byte == b'\r';
                    echo.extend_from_slice(b"\r\n");
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    edits.push(Edit::Line(line));
                }
                0x7F | 0x08 => {
                    if self.pop_char() {
                        echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                0x03 => {
                    self.line.clear();
                    echo.extend_from_slice(b"^C\r\n");
                    edits.push(Edit::Interrupt);
                }
                0x04 => {
                    if self.line.is_empty() {
                        edits.push(Edit::EndOfInput);
                    }
                }
                0x1B => self.escape = Escape::Started,
                b if b < 0x20 => {}
                b => {
                    if self.line.len() < MAX_LINE {
                        self.line.push(b);
                        echo.push(b);
                    }
                }
            }
        }

        if !self.echo {
            echo.clear();
        }
        (echo, edits)
    }

    /// Drop the last character, whole UTF-8 sequences at a time
    fn pop_char(&mut self) -> bool {
        let Some(mut last) = self.line.pop() else {
            return false;
        };
        while last & 0xC0 == 0x80 {
            match self.line.pop() {
                Some(prev) => last = prev,
                None => break,
            }
        }
        true
    }
}

/// Terminal line endings for output text
fn crlf(text: &str) -> Vec<u8> {
    text.replace("\r\n", "\n").replace('\n', "\r\n").into_bytes()
}

// ============================================================================
// Connection handling
// ============================================================================

/// What outlives the handler once russh is done with it
#[derive(Debug, Default)]
struct SessionRecord {
    identity: Option<String>,
    logged_out: bool,
}

type SharedRecord = Arc<Mutex<SessionRecord>>;

fn update(record: &SharedRecord, f: impl FnOnce(&mut SessionRecord)) {
    f(&mut record.lock().unwrap_or_else(|p| p.into_inner()));
}

struct SshHandler {
    peer: SocketAddr,
    session_id: String,
    settings: Arc<LoginSettings>,
    sink: SharedSink,
    identity: Option<String>,
    shell: Option<ShellSession>,
    editor: LineEditor,
    record: SharedRecord,
}

impl SshHandler {
    /// Log and run one command line
    fn execute(&mut self, line: &str) -> CommandOutcome {
        let Some(shell) = self.shell.as_mut() else {
            return CommandOutcome::Exit;
        };
        self.sink.info(
            KIND,
            &format!(
                "{}@{} [{}] executed command: {}",
                shell.identity(),
                self.peer,
                self.session_id,
                line
            ),
        );
        shell.execute(line)
    }

    fn prompt(&self) -> String {
        self.shell.as_ref().map(ShellSession::prompt).unwrap_or_default()
    }

    fn open_shell(&mut self) -> bool {
        let Some(identity) = self.identity.as_deref() else {
            return false;
        };
        self.shell = Some(ShellSession::new(identity, self.settings.profile.clone()));
        true
    }

    fn finish(&mut self, channel: ChannelId, session: &mut Session) {
        self.shell = None;
        update(&self.record, |r| r.logged_out = true);
        session.exit_status_request(channel, 0);
        session.eof(channel);
        session.close(channel);
    }
}

#[async_trait]
impl server::Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.settings.authenticate(user, password) {
            Some(identity) => {
                self.sink.info(
                    KIND,
                    &format!("Login success: {} from {}", identity, self.peer),
                );
                update(&self.record, |r| r.identity = Some(identity.clone()));
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            None => {
                self.sink.warning(
                    KIND,
                    &format!(
                        "Login failed: {} from {} with password: {}",
                        user, self.peer, password
                    ),
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.identity.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.editor.echo = true;
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.open_shell() {
            session.channel_failure(channel);
            return Ok(());
        }
        session.channel_success(channel);
        let opening = format!("{}\n{}", canned::banner(), self.prompt());
        session.data(channel, CryptoVec::from_slice(&crlf(&opening)));
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.open_shell() {
            session.channel_failure(channel);
            return Ok(());
        }
        session.channel_success(channel);

        let command = String::from_utf8_lossy(data).trim().to_string();
        if let CommandOutcome::Output(text) = self.execute(&command) {
            if !text.is_empty() {
                session.data(channel, CryptoVec::from_slice(&crlf(&format!("{}\n", text))));
            }
        }
        self.finish(channel, session);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.shell.is_none() {
            return Ok(());
        }

        let (mut out, edits) = self.editor.feed(data);
        let mut exited = false;
        for edit in edits {
            match edit {
                Edit::Line(line) => match self.execute(&line) {
                    CommandOutcome::Exit => exited = true,
                    CommandOutcome::Output(text) if text.is_empty() => {
                        out.extend(crlf(&self.prompt()))
                    }
                    CommandOutcome::Output(text) => {
                        out.extend(crlf(&format!("{}\n\n{}", text, self.prompt())))
                    }
                },
                Edit::Interrupt => out.extend(crlf(&self.prompt())),
                Edit::EndOfInput => exited = true,
            }
            if exited {
                out.extend(crlf("Logging off...\n"));
                break;
            }
        }

        if !out.is_empty() {
            session.data(channel, CryptoVec::from_slice(&out));
        }
        if exited {
            self.finish(channel, session);
        }
        Ok(())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    Logout,
    Disconnected,
    NotAuthenticated,
    Shutdown,
    Failed(String),
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Logout => write!(f, "logout"),
            SessionEnd::Disconnected => write!(f, "client disconnected"),
            SessionEnd::NotAuthenticated => write!(f, "not authenticated"),
            SessionEnd::Shutdown => write!(f, "decoy shutting down"),
            SessionEnd::Failed(reason) => write!(f, "error: {}", reason),
        }
    }
}

async fn run_ssh(
    ssh: Arc<server::Config>,
    stream: TcpStream,
    handler: SshHandler,
) -> Result<(), russh::Error> {
    let running = server::run_stream(ssh, stream, handler).await?;
    running.await
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ssh: Arc<server::Config>,
    settings: Arc<LoginSettings>,
    sink: SharedSink,
    token: CancellationToken,
) {
    let session_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    sink.info(
        KIND,
        &format!("New connection from {} [session {}]", peer, session_id),
    );

    let record = SharedRecord::default();
    let handler = SshHandler {
        peer,
        session_id: session_id.clone(),
        settings,
        sink: Arc::clone(&sink),
        identity: None,
        shell: None,
        editor: LineEditor::default(),
        record: Arc::clone(&record),
    };

    let outcome = tokio::select! {
        _ = token.cancelled() => Err(SessionEnd::Shutdown),
        served = run_ssh(ssh, stream, handler) => served.map_err(|e| {
            debug!("SSH session {} from {} failed: {}", session_id, peer, e);
            SessionEnd::Failed(e.to_string())
        }),
    };

    let record = record.lock().unwrap_or_else(|p| p.into_inner());
    let end = match outcome {
        _ if record.logged_out => SessionEnd::Logout,
        Err(end) => end,
        Ok(()) if record.identity.is_none() => SessionEnd::NotAuthenticated,
        Ok(()) => SessionEnd::Disconnected,
    };
    let identity = record.identity.as_deref().unwrap_or("<unauthenticated>");
    sink.info(
        KIND,
        &format!(
            "Session {} for {}@{} ended ({})",
            session_id, identity, peer, end
        ),
    );
}
