//! FTP decoy - IIS-flavoured control channel over an in-memory file list.
//!
//! `FtpSession` holds the per-connection protocol state and maps each command
//! line to an `FtpAction`; the transport carries out actions that need sockets
//! (passive listeners and data transfers). Nothing is ever written to disk:
//! uploads are drained and discarded, downloads are synthesized.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use snare_common::config::{Credential, FtpConfig};
use snare_common::DecoyKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{spawn_serve, DecoyAdapter, DecoyError, DecoyTask, Lifecycle};
use crate::events::{EventSink, SharedSink};

const KIND: DecoyKind = DecoyKind::Ftp;

const MAX_LINE: usize = 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const DATA_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_LOGIN_FAILURES: u32 = 3;

/// Cap on bytes read from a single upload before the data socket is dropped
const MAX_UPLOAD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub name: String,
    pub size: u64,
}

impl FakeFile {
    fn new(name: &str) -> Self {
        // Stable per name so repeated LIST/SIZE calls agree
        let seed = name.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let size = 4_096 + seed % 2_000_000;
        Self {
            name: name.to_string(),
            size,
        }
    }

    /// IIS-style (MS-DOS) listing line
    fn list_line(&self) -> String {
        format!("06-12-25  09:14AM {:>20} {}", self.size, self.name)
    }

    fn payload(&self) -> Vec<u8> {
        let len = self.size.min(256 * 1024) as usize;
        let seed = self.size ^ self.name.len() as u64;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }
}

pub struct FtpSettings {
    banner: String,
    allow_anonymous: bool,
    users: Vec<Credential>,
    files: Vec<FakeFile>,
}

impl FtpSettings {
    pub fn from_config(config: &FtpConfig) -> Self {
        Self {
            banner: config.banner.clone(),
            allow_anonymous: config.allow_anonymous,
            users: config.users.clone(),
            files: config.fake_files.iter().map(|name| FakeFile::new(name)).collect(),
        }
    }

    fn file(&self, name: &str) -> Option<&FakeFile> {
        let name = name.trim_start_matches('/');
        self.files.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// Data-channel operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    List,
    Nlst,
    Retr(FakeFile),
    Stor(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtpAction {
    Reply(String),
    /// Send the reply, then close the control connection
    Quit(String),
    /// Open a passive listener
    Passive,
    Transfer(Transfer),
}

impl FtpAction {
    fn reply(text: &str) -> Self {
        FtpAction::Reply(text.to_string())
    }
}

/// Per-connection protocol state
pub struct FtpSession {
    settings: Arc<FtpSettings>,
    peer: SocketAddr,
    pending_user: Option<String>,
    user: Option<String>,
    failures: u32,
}

impl FtpSession {
    pub fn new(settings: Arc<FtpSettings>, peer: SocketAddr) -> Self {
        Self {
            settings,
            peer,
            pending_user: None,
            user: None,
            failures: 0,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn handle(&mut self, line: &str, sink: &dyn EventSink) -> FtpAction {
        let line = line.trim();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "USER" => self.user_command(arg),
            "PASS" => self.pass_command(arg, sink),
            "QUIT" => FtpAction::Quit("221 Goodbye.".to_string()),
            "SYST" => FtpAction::reply("215 Windows_NT"),
            "FEAT" => FtpAction::reply("211-Extended features supported:\r\n SIZE\r\n PASV\r\n UTF8\r\n211 END"),
            "NOOP" => FtpAction::reply("200 NOOP command successful."),
            "OPTS" => FtpAction::reply("200 OPTS UTF8 command successful."),
            _ if self.user.is_none() => FtpAction::reply("530 Please login with USER and PASS."),
            "PWD" | "XPWD" => FtpAction::reply("257 \"/\" is current directory."),
            "CWD" | "CDUP" => match arg {
                "" | "/" | "." | ".." => FtpAction::reply("250 CWD command successful."),
                _ => FtpAction::reply("550 The system cannot find the file specified."),
            },
            "TYPE" => match arg.to_ascii_uppercase().as_str() {
                "A" | "A N" => FtpAction::reply("200 Type set to A."),
                "I" | "L 8" => FtpAction::reply("200 Type set to I."),
                _ => FtpAction::reply("501 Invalid type."),
            },
            "PASV" => FtpAction::Passive,
            "LIST" => FtpAction::Transfer(Transfer::List),
            "NLST" => FtpAction::Transfer(Transfer::Nlst),
            "SIZE" => match self.settings.file(arg) {
                Some(file) => FtpAction::Reply(format!("213 {}", file.size)),
                None => FtpAction::reply("550 The system cannot find the file specified."),
            },
            "RETR" => match self.settings.file(arg) {
                Some(file) => FtpAction::Transfer(Transfer::Retr(file.clone())),
                None => FtpAction::reply("550 The system cannot find the file specified."),
            },
            "STOR" | "APPE" if arg.is_empty() => FtpAction::reply("501 Syntax error in parameters or arguments."),
            "STOR" | "APPE" => FtpAction::Transfer(Transfer::Stor(arg.to_string())),
            "DELE" | "MKD" | "XMKD" | "RMD" | "XRMD" | "RNFR" | "RNTO" => {
                FtpAction::reply("550 Access is denied.")
            }
            _ => FtpAction::reply("502 Command not implemented."),
        }
    }

    fn user_command(&mut self, arg: &str) -> FtpAction {
        if arg.is_empty() {
            return FtpAction::reply("501 Syntax error in parameters or arguments.");
        }
        self.user = None;
        self.pending_user = Some(arg.to_string());
        if self.settings.allow_anonymous && is_anonymous(arg) {
            FtpAction::reply("331 Anonymous access allowed, send identity (e-mail name) as password.")
        } else {
            FtpAction::Reply(format!("331 Password required for {}.", arg))
        }
    }

    fn pass_command(&mut self, password: &str, sink: &dyn EventSink) -> FtpAction {
        let Some(username) = self.pending_user.take() else {
            return FtpAction::reply("503 Login with USER first.");
        };

        let accepted = (self.settings.allow_anonymous && is_anonymous(&username))
            || self
                .settings
                .users
                .iter()
                .any(|c| c.username.eq_ignore_ascii_case(&username) && c.password == password);

        if accepted {
            sink.info(
                KIND,
                &format!("Login success: {} from {}", username, self.peer),
            );
            self.user = Some(username);
            return FtpAction::reply("230 User logged in.");
        }

        self.failures += 1;
        sink.warning(
            KIND,
            &format!(
                "Login failed: {} from {} with password: {}",
                username, self.peer, password
            ),
        );
        if self.failures >= MAX_LOGIN_FAILURES {
            FtpAction::Quit("421 Too many failed login attempts.".to_string())
        } else {
            FtpAction::reply("530 User cannot log in.")
        }
    }
}

fn is_anonymous(user: &str) -> bool {
    user.eq_ignore_ascii_case("anonymous") || user.eq_ignore_ascii_case("ftp")
}

/// Command text safe to log; passwords are reported by the login event instead
fn loggable(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.get(..4).map_or(false, |verb| verb.eq_ignore_ascii_case("PASS")) {
        "PASS ****".to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct FtpDecoy {
    settings: Arc<FtpSettings>,
    addr: SocketAddr,
    lifecycle: Lifecycle,
}

impl FtpDecoy {
    pub fn new(config: FtpConfig, addr: SocketAddr) -> Self {
        Self {
            settings: Arc::new(FtpSettings::from_config(&config)),
            addr,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl DecoyAdapter for FtpDecoy {
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

        sink.info(KIND, &format!("FTP decoy listening on {}", self.addr));
        let token = guard.token();
        let settings = Arc::clone(&self.settings);
        Ok(spawn_serve(guard, accept_loop(listener, settings, sink, token)))
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    settings: Arc<FtpSettings>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), DecoyError> {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                sink.info(KIND, "FTP decoy stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let settings = Arc::clone(&settings);
                    let sink = Arc::clone(&sink);
                    let token = token.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, settings, &sink, token).await {
                            debug!("FTP connection {} ended with error: {}", peer, e);
                        }
                        sink.info(KIND, &format!("Connection from {} closed", peer));
                    });
                }
                Err(e) => {
                    warn!("FTP accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<FtpSettings>,
    sink: &SharedSink,
    token: CancellationToken,
) -> std::io::Result<()> {
    sink.info(KIND, &format!("New connection from {}", peer));
    let local_ip = stream.local_addr()?.ip();
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE));
    let mut session = FtpSession::new(Arc::clone(&settings), peer);
    let mut passive: Option<TcpListener> = None;

    send(&mut writer, &settings.banner).await?;

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => {
                let _ = send(&mut writer, "421 Service not available, closing control connection.").await;
                return Ok(());
            }
            read = tokio::time::timeout(IDLE_TIMEOUT, lines.next()) => match read {
                Err(_) => {
                    let _ = send(&mut writer, "421 Timeout.").await;
                    return Ok(());
                }
                Ok(None) | Ok(Some(Err(_))) => return Ok(()),
                Ok(Some(Ok(line))) => line,
            }
        };

        let action = session.handle(&line, sink.as_ref());
        let (reply, close) = match action {
            FtpAction::Reply(reply) => (reply, false),
            FtpAction::Quit(reply) => (reply, true),
            FtpAction::Passive => match open_passive(local_ip).await {
                Ok((listener, reply)) => {
                    passive = Some(listener);
                    (reply, false)
                }
                Err(e) => {
                    debug!("Passive listener failed: {}", e);
                    ("425 Can't open data connection.".to_string(), false)
                }
            },
            FtpAction::Transfer(transfer) => match passive.take() {
                None => ("425 Use PORT or PASV first.".to_string(), false),
                Some(listener) => {
                    send(&mut writer, "150 Opening data connection.").await?;
                    let outcome = run_transfer(listener, &transfer, &settings).await;
                    if let (Transfer::Stor(name), Ok(bytes)) = (&transfer, &outcome) {
                        sink.warning(
                            KIND,
                            &format!("Upload of {} from {} discarded ({} bytes)", name, peer, bytes),
                        );
                    }
                    match outcome {
                        Ok(_) => ("226 Transfer complete.".to_string(), false),
                        Err(_) => ("425 Can't open data connection.".to_string(), false),
                    }
                }
            },
        };

        sink.info(
            KIND,
            &format!(
                "{} ({}) {} -> {}",
                peer,
                session.user().unwrap_or("-"),
                loggable(&line),
                reply.get(..3).unwrap_or(reply.as_str())
            ),
        );
        send(&mut writer, &reply).await?;
        if close {
            return Ok(());
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, reply: &str) -> std::io::Result<()> {
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn open_passive(local_ip: IpAddr) -> std::io::Result<(TcpListener, String)> {
    let IpAddr::V4(v4) = local_ip else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "PASV requires IPv4",
        ));
    };
    let listener = TcpListener::bind(SocketAddr::new(local_ip, 0)).await?;
    let port = listener.local_addr()?.port();
    let [a, b, c, d] = v4.octets();
    let reply = format!(
        "227 Entering Passive Mode ({},{},{},{},{},{}).",
        a,
        b,
        c,
        d,
        port >> 8,
        port & 0xFF
    );
    Ok((listener, reply))
}

/// Accept the data connection and move bytes; returns bytes transferred
async fn run_transfer(
    listener: TcpListener,
    transfer: &Transfer,
    settings: &FtpSettings,
) -> std::io::Result<u64> {
    let (mut data, _) = tokio::time::timeout(DATA_TIMEOUT, listener.accept())
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "data connection timeout"))??;

    let body: Vec<u8> = match transfer {
        Transfer::List => settings
            .files
            .iter()
            .map(|f| format!("{}\r\n", f.list_line()))
            .collect::<String>()
            .into_bytes(),
        Transfer::Nlst => settings
            .files
            .iter()
            .map(|f| format!("{}\r\n", f.name))
            .collect::<String>()
            .into_bytes(),
        Transfer::Retr(file) => file.payload(),
        Transfer::Stor(_) => {
            let mut sink = tokio::io::sink();
            let mut limited = (&mut data).take(MAX_UPLOAD);
            let received =
                tokio::time::timeout(IDLE_TIMEOUT, tokio::io::copy(&mut limited, &mut sink))
                    .await
                    .map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "upload stalled")
                    })??;
            return Ok(received);
        }
    };

    data.write_all(&body).await?;
    data.shutdown().await?;
    Ok(body.len() as u64)
}
