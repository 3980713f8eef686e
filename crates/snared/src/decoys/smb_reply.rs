//! Canned SMB replies.
//!
//! Enough of SMB2 to carry a client through NEGOTIATE and into NTLM
//! authentication, where every attempt is refused after the username has been
//! read out of the AUTHENTICATE message. SMB1 clients are either upgraded to
//! SMB2 or told that no dialect is acceptable. Every request gets a reply so a
//! scanner never sits on a silent socket.

use rand::{Rng, RngCore};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SMB1_MAGIC: &[u8; 4] = b"\xFFSMB";
pub const SMB2_MAGIC: &[u8; 4] = b"\xFESMB";

pub const STATUS_SUCCESS: u32 = 0;
pub const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;
pub const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
pub const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;
pub const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;

pub const SMB2_NEGOTIATE: u16 = 0x00;
pub const SMB2_SESSION_SETUP: u16 = 0x01;
const SMB2_LOGOFF: u16 = 0x02;
const SMB2_TREE_CONNECT: u16 = 0x03;
const SMB2_ECHO: u16 = 0x0D;

const SMB1_NEGOTIATE: u8 = 0x72;

const SMB2_HEADER_LEN: usize = 64;
const SMB2_FLAGS_SERVER_TO_REDIR: u32 = 0x0000_0001;

/// Dialects offered back to SMB2 clients, in ascending preference
const DIALECTS: [u16; 4] = [0x0202, 0x0210, 0x0300, 0x0302];
const DIALECT_WILDCARD: u16 = 0x02FF;

const MAX_IO: u32 = 8 * 1024 * 1024;

const NTLMSSP: &[u8; 8] = b"NTLMSSP\0";
const NTLM_NEGOTIATE: u32 = 1;
const NTLM_AUTHENTICATE: u32 = 3;
const NTLM_UNICODE: u32 = 0x0000_0001;
const NTLM_CHALLENGE_FLAGS: u32 = NTLM_UNICODE
    | 0x0000_0004 // REQUEST_TARGET
    | 0x0000_0200 // NTLM
    | 0x0000_8000 // ALWAYS_SIGN
    | 0x0001_0000 // TARGET_TYPE_DOMAIN
    | 0x0008_0000 // EXTENDED_SESSIONSECURITY
    | 0x0080_0000 // TARGET_INFO
    | 0x0200_0000 // VERSION
    | 0x2000_0000 // 128
    | 0x8000_0000; // 56

/// Windows Server 2019, NTLM revision 15
const NTLM_VERSION: [u8; 8] = [10, 0, 0x63, 0x45, 0, 0, 0, 15];

/// Seconds between 1601-01-01 and the Unix epoch
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

/// Credentials pulled out of an NTLM AUTHENTICATE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAttempt {
    pub domain: String,
    pub user: String,
    pub workstation: String,
}

/// Result of one SMB message
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Exchange {
    /// SMB message to send back, without the NetBIOS header
    pub reply: Option<Vec<u8>>,
    pub login: Option<LoginAttempt>,
    /// UNC path of a refused TREE_CONNECT
    pub share: Option<String>,
}

impl Exchange {
    fn reply(reply: Vec<u8>) -> Self {
        Self {
            reply: Some(reply),
            ..Self::default()
        }
    }
}

/// Per-connection protocol state
pub struct SmbResponder {
    server_guid: [u8; 16],
    server_name: String,
    domain: String,
    session_id: u64,
    started: u64,
}

impl SmbResponder {
    pub fn new(server_name: &str, domain: &str) -> Self {
        let mut rng = rand::thread_rng();
        let mut server_guid = [0u8; 16];
        rng.fill_bytes(&mut server_guid);
        Self {
            server_guid,
            server_name: server_name.to_ascii_uppercase(),
            domain: domain.to_ascii_uppercase(),
            session_id: rng.gen::<u64>() | 1,
            // Pretend the server has been up for a while
            started: filetime_now().saturating_sub(rng.gen_range(1..30) * 86_400 * 10_000_000),
        }
    }

    /// Answer one SMB message
    pub fn handle(&mut self, payload: &[u8]) -> Exchange {
        match payload.get(..4) {
            Some(magic) if magic == SMB1_MAGIC => self.smb1(payload),
            Some(magic) if magic == SMB2_MAGIC => self.smb2(payload),
            _ => Exchange::default(),
        }
    }

    fn smb1(&self, payload: &[u8]) -> Exchange {
        let Some(header) = payload.get(..32) else {
            return Exchange::default();
        };

        if payload[4] == SMB1_NEGOTIATE {
            let dialects = &payload[32..];
            if contains(dialects, b"SMB 2.???") {
                return Exchange::reply(self.negotiate_response(0, DIALECT_WILDCARD));
            }
            if contains(dialects, b"SMB 2.002") {
                return Exchange::reply(self.negotiate_response(0, 0x0202));
            }
            // SMB1-only client: no acceptable dialect
            let mut reply = smb1_reply_header(header, STATUS_SUCCESS);
            reply.extend_from_slice(&[1, 0xFF, 0xFF, 0, 0]);
            return Exchange::reply(reply);
        }

        let mut reply = smb1_reply_header(header, STATUS_ACCESS_DENIED);
        reply.extend_from_slice(&[0, 0, 0]);
        Exchange::reply(reply)
    }

    fn smb2(&mut self, payload: &[u8]) -> Exchange {
        if payload.len() < SMB2_HEADER_LEN {
            return Exchange::default();
        }
        let command = read_u16(payload, 12).unwrap_or_default();
        let message_id = read_u64(payload, 24).unwrap_or_default();

        match command {
            SMB2_NEGOTIATE => match choose_dialect(payload) {
                Some(dialect) => Exchange::reply(self.negotiate_response(message_id, dialect)),
                None => Exchange::reply(error_response(
                    command,
                    message_id,
                    STATUS_NOT_SUPPORTED,
                    0,
                )),
            },
            SMB2_SESSION_SETUP => self.session_setup(payload, message_id),
            SMB2_TREE_CONNECT => {
                let path = buffer(payload, SMB2_HEADER_LEN + 4, SMB2_HEADER_LEN + 6)
                    .map(decode_utf16)
                    .unwrap_or_default();
                Exchange {
                    reply: Some(error_response(
                        command,
                        message_id,
                        STATUS_ACCESS_DENIED,
                        read_u64(payload, 40).unwrap_or_default(),
                    )),
                    share: Some(path),
                    ..Exchange::default()
                }
            }
            SMB2_LOGOFF | SMB2_ECHO => {
                let mut reply = smb2_header(command, message_id, STATUS_SUCCESS, 0);
                reply.extend_from_slice(&[4, 0, 0, 0]);
                Exchange::reply(reply)
            }
            _ => Exchange::reply(error_response(
                command,
                message_id,
                STATUS_ACCESS_DENIED,
                read_u64(payload, 40).unwrap_or_default(),
            )),
        }
    }

    fn session_setup(&self, payload: &[u8], message_id: u64) -> Exchange {
        let blob = buffer(payload, SMB2_HEADER_LEN + 12, SMB2_HEADER_LEN + 14).unwrap_or(&[]);
        let ntlm = find_ntlmssp(blob);

        match ntlm.and_then(|msg| read_u32(msg, 8)) {
            Some(NTLM_NEGOTIATE) => {
                let challenge = self.ntlm_challenge();
                let mut reply = smb2_header(
                    SMB2_SESSION_SETUP,
                    message_id,
                    STATUS_MORE_PROCESSING_REQUIRED,
                    self.session_id,
                );
                reply.extend_from_slice(&9u16.to_le_bytes());
                reply.extend_from_slice(&0u16.to_le_bytes());
                reply.extend_from_slice(&((SMB2_HEADER_LEN + 8) as u16).to_le_bytes());
                reply.extend_from_slice(&(challenge.len() as u16).to_le_bytes());
                reply.extend_from_slice(&challenge);
                Exchange::reply(reply)
            }
            Some(NTLM_AUTHENTICATE) => Exchange {
                reply: Some(error_response(
                    SMB2_SESSION_SETUP,
                    message_id,
                    STATUS_LOGON_FAILURE,
                    self.session_id,
                )),
                login: ntlm.and_then(parse_authenticate),
                ..Exchange::default()
            },
            _ => Exchange::reply(error_response(
                SMB2_SESSION_SETUP,
                message_id,
                STATUS_LOGON_FAILURE,
                self.session_id,
            )),
        }
    }

    fn negotiate_response(&self, message_id: u64, dialect: u16) -> Vec<u8> {
        let mut reply = smb2_header(SMB2_NEGOTIATE, message_id, STATUS_SUCCESS, 0);
        let capabilities: u32 = if dialect >= 0x0210 { 0x7 } else { 0x1 };

        reply.extend_from_slice(&65u16.to_le_bytes());
        reply.extend_from_slice(&1u16.to_le_bytes()); // signing enabled
        reply.extend_from_slice(&dialect.to_le_bytes());
        reply.extend_from_slice(&0u16.to_le_bytes());
        reply.extend_from_slice(&self.server_guid);
        reply.extend_from_slice(&capabilities.to_le_bytes());
        reply.extend_from_slice(&MAX_IO.to_le_bytes());
        reply.extend_from_slice(&MAX_IO.to_le_bytes());
        reply.extend_from_slice(&MAX_IO.to_le_bytes());
        reply.extend_from_slice(&filetime_now().to_le_bytes());
        reply.extend_from_slice(&self.started.to_le_bytes());
        reply.extend_from_slice(&((SMB2_HEADER_LEN + 64) as u16).to_le_bytes());
        reply.extend_from_slice(&0u16.to_le_bytes());
        reply.extend_from_slice(&0u32.to_le_bytes());
        reply
    }

    fn ntlm_challenge(&self) -> Vec<u8> {
        const FIXED: usize = 56;
        let target = encode_utf16(&self.domain);

        let mut info = Vec::new();
        av_pair(&mut info, 2, &target);
        av_pair(&mut info, 1, &encode_utf16(&self.server_name));
        av_pair(&mut info, 7, &filetime_now().to_le_bytes());
        av_pair(&mut info, 0, &[]);

        let mut challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut challenge);

        let mut msg = Vec::with_capacity(FIXED + target.len() + info.len());
        msg.extend_from_slice(NTLMSSP);
        msg.extend_from_slice(&2u32.to_le_bytes());
        push_field(&mut msg, target.len(), FIXED);
        msg.extend_from_slice(&NTLM_CHALLENGE_FLAGS.to_le_bytes());
        msg.extend_from_slice(&challenge);
        msg.extend_from_slice(&[0u8; 8]);
        push_field(&mut msg, info.len(), FIXED + target.len());
        msg.extend_from_slice(&NTLM_VERSION);
        msg.extend_from_slice(&target);
        msg.extend_from_slice(&info);
        msg
    }
}

fn smb2_header(command: u16, message_id: u64, status: u32, session_id: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(SMB2_HEADER_LEN + 72);
    h.extend_from_slice(SMB2_MAGIC);
    h.extend_from_slice(&(SMB2_HEADER_LEN as u16).to_le_bytes());
    h.extend_from_slice(&0u16.to_le_bytes()); // credit charge
    h.extend_from_slice(&status.to_le_bytes());
    h.extend_from_slice(&command.to_le_bytes());
    h.extend_from_slice(&1u16.to_le_bytes()); // credits granted
    h.extend_from_slice(&SMB2_FLAGS_SERVER_TO_REDIR.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // next command
    h.extend_from_slice(&message_id.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // process id
    h.extend_from_slice(&0u32.to_le_bytes()); // tree id
    h.extend_from_slice(&session_id.to_le_bytes());
    h.extend_from_slice(&[0u8; 16]); // signature
    h
}

fn error_response(command: u16, message_id: u64, status: u32, session_id: u64) -> Vec<u8> {
    let mut reply = smb2_header(command, message_id, status, session_id);
    reply.extend_from_slice(&[9, 0, 0, 0, 0, 0, 0, 0, 0]);
    reply
}

fn smb1_reply_header(request: &[u8], status: u32) -> Vec<u8> {
    let mut header = request.to_vec();
    header[5..9].copy_from_slice(&status.to_le_bytes());
    header[9] |= 0x80;
    header
}

/// Highest dialect both sides speak
fn choose_dialect(payload: &[u8]) -> Option<u16> {
    let count = read_u16(payload, SMB2_HEADER_LEN + 2)? as usize;
    let offered: Vec<u16> = (0..count)
        .map_while(|i| read_u16(payload, SMB2_HEADER_LEN + 36 + i * 2))
        .collect();
    DIALECTS.iter().rev().find(|d| offered.contains(d)).copied()
}

fn parse_authenticate(msg: &[u8]) -> Option<LoginAttempt> {
    let unicode = read_u32(msg, 60).map_or(true, |flags| flags & NTLM_UNICODE != 0);
    let text = |at: usize| -> Option<String> {
        let bytes = ntlm_field(msg, at)?;
        Some(if unicode {
            decode_utf16(bytes)
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        })
    };
    Some(LoginAttempt {
        domain: text(28)?,
        user: text(36)?,
        workstation: text(44).unwrap_or_default(),
    })
}

/// `len, max_len, offset` security buffer inside an NTLM message
fn ntlm_field(msg: &[u8], at: usize) -> Option<&[u8]> {
    let len = read_u16(msg, at)? as usize;
    let offset = read_u32(msg, at + 4)? as usize;
    msg.get(offset..offset.checked_add(len)?)
}

fn push_field(msg: &mut Vec<u8>, len: usize, offset: usize) {
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&(offset as u32).to_le_bytes());
}

fn av_pair(out: &mut Vec<u8>, id: u16, value: &[u8]) {
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
}

fn find_ntlmssp(blob: &[u8]) -> Option<&[u8]> {
    let start = blob.windows(NTLMSSP.len()).position(|w| w == NTLMSSP)?;
    Some(&blob[start..])
}

/// Slice described by a 16-bit offset/length pair at fixed positions
fn buffer(payload: &[u8], offset_at: usize, len_at: usize) -> Option<&[u8]> {
    let offset = read_u16(payload, offset_at)? as usize;
    let len = read_u16(payload, len_at)? as usize;
    payload.get(offset..offset + len)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let b = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let b = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Some(u64::from_le_bytes(raw))
}

fn encode_utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn filetime_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000 + u64::from(now.subsec_nanos() / 100)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn smb2_request(command: u16, message_id: u64, body: &[u8]) -> Vec<u8> {
        let mut msg = vec![0u8; SMB2_HEADER_LEN];
        msg[..4].copy_from_slice(SMB2_MAGIC);
        msg[4..6].copy_from_slice(&64u16.to_le_bytes());
        msg[12..14].copy_from_slice(&command.to_le_bytes());
        msg[24..32].copy_from_slice(&message_id.to_le_bytes());
        msg.extend_from_slice(body);
        msg
    }

    pub(crate) fn negotiate_body(dialects: &[u16]) -> Vec<u8> {
        let mut body = vec![0u8; 36];
        body[..2].copy_from_slice(&36u16.to_le_bytes());
        body[2..4].copy_from_slice(&(dialects.len() as u16).to_le_bytes());
        for d in dialects {
            body.extend_from_slice(&d.to_le_bytes());
        }
        body
    }

    /// SESSION_SETUP body carrying `blob`
    pub(crate) fn session_setup_body(blob: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 24];
        body[..2].copy_from_slice(&25u16.to_le_bytes());
        body[12..14].copy_from_slice(&((SMB2_HEADER_LEN + 24) as u16).to_le_bytes());
        body[14..16].copy_from_slice(&(blob.len() as u16).to_le_bytes());
        body.extend_from_slice(blob);
        body
    }

    pub(crate) fn ntlm_negotiate() -> Vec<u8> {
        let mut msg = NTLMSSP.to_vec();
        msg.extend_from_slice(&NTLM_NEGOTIATE.to_le_bytes());
        msg.extend_from_slice(&NTLM_UNICODE.to_le_bytes());
        msg.extend_from_slice(&[0u8; 16]);
        msg
    }

    pub(crate) fn ntlm_authenticate(domain: &str, user: &str, workstation: &str) -> Vec<u8> {
        const FIXED: usize = 64;
        let (d, u, w) = (encode_utf16(domain), encode_utf16(user), encode_utf16(workstation));
        let mut msg = NTLMSSP.to_vec();
        msg.extend_from_slice(&NTLM_AUTHENTICATE.to_le_bytes());
        push_field(&mut msg, 0, FIXED); // LM response
        push_field(&mut msg, 0, FIXED); // NT response
        push_field(&mut msg, d.len(), FIXED);
        push_field(&mut msg, u.len(), FIXED + d.len());
        push_field(&mut msg, w.len(), FIXED + d.len() + u.len());
        push_field(&mut msg, 0, FIXED); // session key
        msg.extend_from_slice(&NTLM_UNICODE.to_le_bytes());
        msg.extend_from_slice(&d);
        msg.extend_from_slice(&u);
        msg.extend_from_slice(&w);
        msg
    }

    fn status(reply: &[u8]) -> u32 {
        read_u32(reply, 8).unwrap()
    }

    fn responder() -> SmbResponder {
        SmbResponder::new("fs01", "contoso")
    }

    #[test]
    fn test_negotiate_picks_highest_common_dialect() {
        let mut r = responder();
        let req = smb2_request(SMB2_NEGOTIATE, 0, &negotiate_body(&[0x0202, 0x0210, 0x0311]));
        let reply = r.handle(&req).reply.unwrap();

        assert_eq!(&reply[..4], SMB2_MAGIC);
        assert_eq!(status(&reply), STATUS_SUCCESS);
        assert_eq!(read_u32(&reply, 16), Some(SMB2_FLAGS_SERVER_TO_REDIR));
        assert_eq!(read_u16(&reply, 64), Some(65));
        assert_eq!(read_u16(&reply, 68), Some(0x0210));
        assert_eq!(reply.len(), SMB2_HEADER_LEN + 64);
    }

    #[test]
    fn test_negotiate_without_dialects_still_answers() {
        let mut r = responder();
        let reply = r.handle(&smb2_request(SMB2_NEGOTIATE, 7, &[])).reply.unwrap();
        assert_eq!(status(&reply), STATUS_NOT_SUPPORTED);
        assert_eq!(read_u64(&reply, 24), Some(7));
    }

    #[test]
    fn test_smb1_negotiate_upgrades_to_smb2() {
        let mut r = responder();
        let mut req = vec![0u8; 32];
        req[..4].copy_from_slice(SMB1_MAGIC);
        req[4] = SMB1_NEGOTIATE;
        req.extend_from_slice(b"\x00\x20\x00\x02NT LM 0.12\x00\x02SMB 2.002\x00\x02SMB 2.???\x00");

        let reply = r.handle(&req).reply.unwrap();
        assert_eq!(&reply[..4], SMB2_MAGIC);
        assert_eq!(read_u16(&reply, 68), Some(DIALECT_WILDCARD));
    }

    #[test]
    fn test_smb1_only_client_gets_no_dialect() {
        let mut r = responder();
        let mut req = vec![0u8; 32];
        req[..4].copy_from_slice(SMB1_MAGIC);
        req[4] = SMB1_NEGOTIATE;
        req.extend_from_slice(b"\x00\x0c\x00\x02NT LM 0.12\x00");

        let reply = r.handle(&req).reply.unwrap();
        assert_eq!(&reply[..4], SMB1_MAGIC);
        assert_eq!(reply[9] & 0x80, 0x80);
        assert_eq!(&reply[32..35], &[1, 0xFF, 0xFF]);
    }

    #[test]
    fn test_ntlm_handshake_ends_in_logon_failure() {
        let mut r = responder();

        let first = r.handle(&smb2_request(
            SMB2_SESSION_SETUP,
            1,
            &session_setup_body(&ntlm_negotiate()),
        ));
        let reply = first.reply.unwrap();
        assert_eq!(status(&reply), STATUS_MORE_PROCESSING_REQUIRED);
        let session_id = read_u64(&reply, 40).unwrap();
        assert_ne!(session_id, 0);
        let blob = buffer(&reply, 68, 70).unwrap();
        assert_eq!(&blob[..8], NTLMSSP);
        assert_eq!(read_u32(blob, 8), Some(2));
        assert_eq!(decode_utf16(ntlm_field(blob, 12).unwrap()), "CONTOSO");

        let second = r.handle(&smb2_request(
            SMB2_SESSION_SETUP,
            2,
            &session_setup_body(&ntlm_authenticate("CONTOSO", "svc_backup", "KALI")),
        ));
        let reply = second.reply.unwrap();
        assert_eq!(status(&reply), STATUS_LOGON_FAILURE);
        assert_eq!(read_u64(&reply, 40), Some(session_id));
        assert_eq!(
            second.login,
            Some(LoginAttempt {
                domain: "CONTOSO".to_string(),
                user: "svc_backup".to_string(),
                workstation: "KALI".to_string(),
            })
        );
    }

    #[test]
    fn test_tree_connect_is_refused_and_reported() {
        let mut r = responder();
        let path = encode_utf16(r"\\FS01\Finance");
        let mut body = vec![0u8; 8];
        body[..2].copy_from_slice(&9u16.to_le_bytes());
        body[4..6].copy_from_slice(&((SMB2_HEADER_LEN + 8) as u16).to_le_bytes());
        body[6..8].copy_from_slice(&(path.len() as u16).to_le_bytes());
        body.extend_from_slice(&path);

        let exchange = r.handle(&smb2_request(SMB2_TREE_CONNECT, 4, &body));
        assert_eq!(status(&exchange.reply.unwrap()), STATUS_ACCESS_DENIED);
        assert_eq!(exchange.share.as_deref(), Some(r"\\FS01\Finance"));
    }

    #[test]
    fn test_echo_and_garbage() {
        let mut r = responder();
        let reply = r.handle(&smb2_request(SMB2_ECHO, 9, &[4, 0, 0, 0])).reply.unwrap();
        assert_eq!(status(&reply), STATUS_SUCCESS);

        assert_eq!(r.handle(b"GET / HTTP/1.1\r\n"), Exchange::default());
        assert_eq!(r.handle(SMB2_MAGIC), Exchange::default());
    }
}
