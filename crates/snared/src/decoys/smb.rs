//! SMB decoy - blocking engine on a worker thread.
//!
//! The listener runs on a `spawn_blocking` thread and hands each connection
//! to its own OS thread. Every SMB message is named in the event log and
//! answered by [`SmbResponder`]: negotiation succeeds, NTLM authentication
//! always fails once the attempted account has been logged.

use async_trait::async_trait;
use snare_common::config::{ShareConfig, SmbConfig};
use snare_common::DecoyKind;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::smb_reply::{SmbResponder, SMB1_MAGIC, SMB2_MAGIC};
use super::{spawn_serve, DecoyAdapter, DecoyError, DecoyTask, Lifecycle};
use crate::events::{EventSink, SharedSink};

const KIND: DecoyKind = DecoyKind::Smb;

/// How often blocking loops look at the cancellation token
const POLL: Duration = Duration::from_millis(200);

/// Frames larger than this close the connection
const MAX_FRAME: usize = 1024 * 1024;

const NBT_SESSION_MESSAGE: u8 = 0x00;
const NBT_SESSION_REQUEST: u8 = 0x81;
const NBT_POSITIVE_RESPONSE: [u8; 4] = [0x82, 0, 0, 0];
const NBT_KEEPALIVE: u8 = 0x85;

// ============================================================================
// Frame decoding
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// More bytes needed
    Incomplete,
    /// Declared length exceeds the cap
    Oversized(usize),
    /// One complete NetBIOS frame; `consumed` covers header and payload
    Complete {
        kind: u8,
        payload: &'a [u8],
        consumed: usize,
    },
}

/// Split the next NetBIOS session frame off `buf`
pub fn next_frame(buf: &[u8]) -> Frame<'_> {
    if buf.len() < 4 {
        return Frame::Incomplete;
    }
    let len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
    if len > MAX_FRAME {
        return Frame::Oversized(len);
    }
    if buf.len() < 4 + len {
        return Frame::Incomplete;
    }
    Frame::Complete {
        kind: buf[0],
        payload: &buf[4..4 + len],
        consumed: 4 + len,
    }
}

/// Operation name for an SMB message, `None` if it is not SMB at all
pub fn describe(payload: &[u8]) -> Option<String> {
    let magic = payload.get(..4)?;
    if magic == SMB1_MAGIC {
        let cmd = *payload.get(4)?;
        return Some(format!("SMB1 {}", smb1_command(cmd)));
    }
    if magic == SMB2_MAGIC {
        let raw = payload.get(12..14)?;
        let cmd = u16::from_le_bytes([raw[0], raw[1]]);
        return Some(format!("SMB2 {}", smb2_command(cmd)));
    }
    None
}

fn smb1_command(cmd: u8) -> String {
    let name = match cmd {
        0x04 => "CLOSE",
        0x25 => "TRANSACTION",
        0x2B => "ECHO",
        0x2E => "READ_ANDX",
        0x2F => "WRITE_ANDX",
        0x32 => "TRANSACTION2",
        0x71 => "TREE_DISCONNECT",
        0x72 => "NEGOTIATE",
        0x73 => "SESSION_SETUP_ANDX",
        0x74 => "LOGOFF_ANDX",
        0x75 => "TREE_CONNECT_ANDX",
        0xA2 => "NT_CREATE_ANDX",
        other => return format!("command 0x{:02X}", other),
    };
    name.to_string()
}

fn smb2_command(cmd: u16) -> String {
    let name = match cmd {
        0x00 => "NEGOTIATE",
        0x01 => "SESSION_SETUP",
        0x02 => "LOGOFF",
        0x03 => "TREE_CONNECT",
        0x04 => "TREE_DISCONNECT",
        0x05 => "CREATE",
        0x06 => "CLOSE",
        0x07 => "FLUSH",
        0x08 => "READ",
        0x09 => "WRITE",
        0x0A => "LOCK",
        0x0B => "IOCTL",
        0x0C => "CANCEL",
        0x0D => "ECHO",
        0x0E => "QUERY_DIRECTORY",
        0x0F => "CHANGE_NOTIFY",
        0x10 => "QUERY_INFO",
        0x11 => "SET_INFO",
        0x12 => "OPLOCK_BREAK",
        other => return format!("command 0x{:04X}", other),
    };
    name.to_string()
}

// ============================================================================
// Adapter
// ============================================================================

pub struct SmbDecoy {
    config: SmbConfig,
    addr: SocketAddr,
    lifecycle: Lifecycle,
}

impl SmbDecoy {
    pub fn new(config: SmbConfig, addr: SocketAddr) -> Self {
        Self {
            config,
            addr,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl DecoyAdapter for SmbDecoy {
    fn kind(&self) -> DecoyKind {
        KIND
    }

    async fn start(&self, sink: SharedSink) -> Result<DecoyTask, DecoyError> {
        let guard = self.lifecycle.begin(KIND)?;
        let listener = TcpListener::bind(self.addr).map_err(|source| DecoyError::Bind {
            addr: self.addr,
            source,
        })?;
        listener.set_nonblocking(true)?;

        sink.info(KIND, &format!("SMB decoy listening on {}", self.addr));
        announce_shares(&self.config.shares, sink.as_ref());

        let token = guard.token();
        let settings = Arc::new(ConnectionSettings::from_config(&self.config));
        Ok(spawn_serve(guard, async move {
            tokio::task::spawn_blocking(move || serve_blocking(listener, settings, sink, token))
                .await
                .map_err(|e| DecoyError::Engine(format!("SMB engine thread failed: {}", e)))?
        }))
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

fn announce_shares(shares: &[ShareConfig], sink: &dyn EventSink) {
    for share in shares {
        sink.info(
            KIND,
            &format!("Sharing \\\\{} ({} files)", share.name, share.files.len()),
        );
    }
}

/// What every connection thread needs from the config
struct ConnectionSettings {
    idle: Duration,
    server_name: String,
    domain: String,
}

impl ConnectionSettings {
    fn from_config(config: &SmbConfig) -> Self {
        Self {
            idle: Duration::from_secs(config.idle_timeout_secs.max(1)),
            server_name: config.server_name.clone(),
            domain: config.domain.clone(),
        }
    }
}

fn serve_blocking(
    listener: TcpListener,
    settings: Arc<ConnectionSettings>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), DecoyError> {
    while !token.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let sink = Arc::clone(&sink);
                let settings = Arc::clone(&settings);
                let token = token.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("smb-{}", peer))
                    .spawn(move || {
                        handle_connection(stream, peer, &settings, sink.as_ref(), &token)
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn SMB connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(POLL),
            Err(e) => {
                warn!("SMB accept failed: {}", e);
                std::thread::sleep(POLL);
            }
        }
    }
    sink.info(KIND, "SMB decoy stopped");
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: &ConnectionSettings,
    sink: &dyn EventSink,
    token: &CancellationToken,
) {
    sink.info(KIND, &format!("New connection from {}", peer));
    let mut responder = SmbResponder::new(&settings.server_name, &settings.domain);
    let pumped = pump_frames(&mut stream, peer, settings.idle, &mut responder, sink, token);
    let reason = match pumped {
        Ok(reason) => reason.to_string(),
        Err(e) => format!("error: {}", e),
    };
    sink.info(KIND, &format!("Connection from {} closed ({})", peer, reason));
}

fn pump_frames(
    stream: &mut TcpStream,
    peer: SocketAddr,
    idle: Duration,
    responder: &mut SmbResponder,
    sink: &dyn EventSink,
    token: &CancellationToken,
) -> std::io::Result<&'static str> {
    // Accepted sockets inherit non-blocking mode on some platforms
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL))?;

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut last_seen = Instant::now();

    loop {
        if token.is_cancelled() {
            return Ok("decoy shutting down");
        }
        if last_seen.elapsed() >= idle {
            return Ok("idle timeout");
        }

        let read = match stream.read(&mut chunk) {
            Ok(0) => return Ok("client disconnected"),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        last_seen = Instant::now();
        buf.extend_from_slice(&chunk[..read]);

        loop {
            let (reply, payload_len, consumed) = match next_frame(&buf) {
                Frame::Incomplete => break,
                Frame::Oversized(len) => {
                    sink.warning(
                        KIND,
                        &format!("Oversized frame ({} bytes) from {}", len, peer),
                    );
                    return Ok("oversized frame");
                }
                Frame::Complete {
                    kind,
                    payload,
                    consumed,
                } => {
                    log_frame(kind, payload, peer, sink);
                    let reply = match kind {
                        NBT_SESSION_REQUEST => Some(NBT_POSITIVE_RESPONSE.to_vec()),
                        NBT_SESSION_MESSAGE => answer(responder, payload, peer, sink),
                        _ => None,
                    };
                    (reply, payload.len(), consumed)
                }
            };
            debug!("SMB frame ({} bytes) from {}", payload_len, peer);
            if let Some(reply) = reply {
                stream.write_all(&reply)?;
            }
            buf.drain(..consumed);
        }
    }
}

/// Run one SMB message through the responder and frame its reply
fn answer(
    responder: &mut SmbResponder,
    payload: &[u8],
    peer: SocketAddr,
    sink: &dyn EventSink,
) -> Option<Vec<u8>> {
    let exchange = responder.handle(payload);
    if let Some(login) = &exchange.login {
        sink.warning(
            KIND,
            &format!(
                "Login attempt from {}: {}\\{} (workstation {})",
                peer, login.domain, login.user, login.workstation
            ),
        );
    }
    if let Some(share) = &exchange.share {
        sink.warning(KIND, &format!("Share access to {} from {} denied", share, peer));
    }
    exchange.reply.map(|reply| nbt_frame(&reply))
}

/// Prefix an SMB message with its NetBIOS session header
pub fn nbt_frame(message: &[u8]) -> Vec<u8> {
    let len = message.len();
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&[
        NBT_SESSION_MESSAGE,
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
    ]);
    out.extend_from_slice(message);
    out
}

fn log_frame(kind: u8, payload: &[u8], peer: SocketAddr, sink: &dyn EventSink) {
    match kind {
        NBT_SESSION_MESSAGE => match describe(payload) {
            Some(op) => sink.info(KIND, &format!("{} from {}", op, peer)),
            None => sink.warning(
                KIND,
                &format!("Non-SMB payload ({} bytes) from {}", payload.len(), peer),
            ),
        },
        NBT_SESSION_REQUEST => sink.info(KIND, &format!("NetBIOS session request from {}", peer)),
        NBT_KEEPALIVE => {}
        other => sink.warning(
            KIND,
            &format!("Unknown NetBIOS frame type 0x{:02X} from {}", other, peer),
        ),
    }
}
