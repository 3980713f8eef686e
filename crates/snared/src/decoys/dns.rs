//! DNS decoy - answers A queries from a static subdomain table.
//!
//! Wire handling goes through `hickory-proto`; only the lookup is ours.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use snare_common::config::DnsConfig;
use snare_common::DecoyKind;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{spawn_serve, DecoyAdapter, DecoyError, DecoyTask, Lifecycle};
use crate::events::{EventSink, SharedSink};

const KIND: DecoyKind = DecoyKind::Dns;

/// Largest datagram read; EDNS clients may send more than 512 bytes
const MAX_DATAGRAM: usize = 4096;

const HEADER_LEN: usize = 12;

/// Stateless per-query responder over the configured record table
pub struct FakeResolver {
    records: HashMap<String, Ipv4Addr>,
    ttl: u32,
}

impl FakeResolver {
    pub fn new(records: HashMap<String, Ipv4Addr>, ttl: u32) -> Self {
        let records = records
            .into_iter()
            .map(|(name, addr)| (name.to_ascii_lowercase(), addr))
            .collect();
        Self { records, ttl }
    }

    pub fn from_config(config: &DnsConfig) -> Result<Self, DecoyError> {
        let records = config
            .parsed_records()
            .map_err(|e| DecoyError::Config(e.to_string()))?;
        Ok(Self::new(records, config.ttl))
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Look up the first label of `name`
    pub fn resolve(&self, name: &Name, client: SocketAddr, sink: &dyn EventSink) -> Option<Ipv4Addr> {
        let shown = display_name(name);
        match self.records.get(&first_label(name)) {
            Some(addr) => {
                sink.info(
                    KIND,
                    &format!("Query from {} for {} resolved to {}", client, shown, addr),
                );
                Some(*addr)
            }
            None => {
                sink.warning(
                    KIND,
                    &format!("Query from {} for {} not found", client, shown),
                );
                None
            }
        }
    }

    /// Reply datagram for a raw query, `None` when nothing should be sent
    pub fn respond(&self, packet: &[u8], client: SocketAddr, sink: &dyn EventSink) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring malformed datagram from {}: {}", client, e);
                return format_error(packet);
            }
        };
        if request.message_type() != MessageType::Query {
            return None;
        }

        let response = self.answer(&request, client, sink);
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode reply for {}: {}", client, e);
                None
            }
        }
    }

    fn answer(&self, request: &Message, client: SocketAddr, sink: &dyn EventSink) -> Message {
        if request.queries().is_empty() {
            return Message::error_msg(request.id(), request.op_code(), ResponseCode::FormErr);
        }
        if request.op_code() != OpCode::Query {
            return Message::error_msg(request.id(), request.op_code(), ResponseCode::NotImp);
        }

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_authoritative(true)
            .set_recursion_desired(request.recursion_desired())
            .set_response_code(ResponseCode::NoError)
            .add_queries(request.queries().to_vec());
        if let Some(edns) = request.extensions() {
            let mut edns = edns.clone();
            edns.set_max_payload(MAX_DATAGRAM as u16);
            response.set_edns(edns);
        }

        for query in request.queries() {
            if let Some(record) = self.answer_query(query, client, sink) {
                response.add_answer(record);
            }
        }
        response
    }

    fn answer_query(&self, query: &Query, client: SocketAddr, sink: &dyn EventSink) -> Option<Record> {
        if query.query_type() != RecordType::A {
            sink.info(
                KIND,
                &format!(
                    "Query from {} for {} with unsupported type {}",
                    client,
                    display_name(query.name()),
                    query.query_type()
                ),
            );
            return None;
        }
        let addr = self.resolve(query.name(), client, sink)?;
        Some(Record::from_rdata(
            query.name().clone(),
            self.ttl,
            RData::A(A(addr)),
        ))
    }
}

/// Lowercased leftmost label, empty for the root
fn first_label(name: &Name) -> String {
    name.iter()
        .next()
        .map(|label| String::from_utf8_lossy(label).to_ascii_lowercase())
        .unwrap_or_default()
}

fn display_name(name: &Name) -> String {
    name.to_string().trim_end_matches('.').to_string()
}

/// Header-only FORMERR for datagrams that at least look like a query header
fn format_error(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < HEADER_LEN || packet[2] & 0x80 != 0 {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    Message::error_msg(id, OpCode::Query, ResponseCode::FormErr)
        .to_vec()
        .ok()
}

pub struct DnsDecoy {
    resolver: Arc<FakeResolver>,
    addr: SocketAddr,
    lifecycle: Lifecycle,
}

impl DnsDecoy {
    pub fn new(config: &DnsConfig, addr: SocketAddr) -> Result<Self, DecoyError> {
        Ok(Self {
            resolver: Arc::new(FakeResolver::from_config(config)?),
            addr,
            lifecycle: Lifecycle::new(),
        })
    }
}

#[async_trait]
impl DecoyAdapter for DnsDecoy {
    fn kind(&self) -> DecoyKind {
        KIND
    }

    async fn start(&self, sink: SharedSink) -> Result<DecoyTask, DecoyError> {
        let guard = self.lifecycle.begin(KIND)?;
        let socket = UdpSocket::bind(self.addr)
            .await
            .map_err(|source| DecoyError::Bind {
                addr: self.addr,
                source,
            })?;

        sink.info(KIND, &format!("DNS decoy listening on {}/udp", self.addr));
        let token = guard.token();
        let resolver = Arc::clone(&self.resolver);
        Ok(spawn_serve(guard, serve(socket, resolver, sink, token)))
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

async fn serve(
    socket: UdpSocket,
    resolver: Arc<FakeResolver>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), DecoyError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                sink.info(KIND, "DNS decoy stopped");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (len, client) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP unreachable from a previous reply surfaces here on some platforms
                        debug!("DNS recv error: {}", e);
                        continue;
                    }
                };
                if let Some(reply) = resolver.respond(&buf[..len], client, sink.as_ref()) {
                    if let Err(e) = socket.send_to(&reply, client).await {
                        warn!("Failed to answer {}: {}", client, e);
                    }
                }
            }
        }
    }
}
