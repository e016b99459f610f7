//! Peer Name Records
//!
//! Maps certificate names of connected peers to their overlay IPs. The
//! handshake manager registers names on promotion through the
//! `NameRegistry` trait; `DnsRecords` is the in-memory table, and
//! `run_dns_responder` answers A queries for it over UDP.

use parking_lot::RwLock;
use simple_dns::rdata::{A, RData};
use simple_dns::{CLASS, Name, Packet, PacketFlag, QTYPE, RCODE, ResourceRecord, TYPE};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Name registration collaborator.
pub trait NameRegistry: Send + Sync {
    /// Point `name` at `vpn_ip`, replacing any previous address.
    fn add(&self, name: &str, vpn_ip: Ipv4Addr);
}

/// Lowercase and fully qualify a name.
fn normalize(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// In-memory name table.
#[derive(Debug, Default)]
pub struct DnsRecords {
    records: RwLock<HashMap<String, Ipv4Addr>>,
}

impl DnsRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address for `name`, ignoring case and the trailing dot.
    pub fn query(&self, name: &str) -> Option<Ipv4Addr> {
        self.records.read().get(&normalize(name)).copied()
    }

    pub fn remove(&self, name: &str) -> Option<Ipv4Addr> {
        self.records.write().remove(&normalize(name))
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl NameRegistry for DnsRecords {
    fn add(&self, name: &str, vpn_ip: Ipv4Addr) {
        debug!(name = %name, vpn_ip = %vpn_ip, "Registering peer name");
        self.records.write().insert(normalize(name), vpn_ip);
    }
}

/// Answer a raw DNS query from `records`.
///
/// A queries for known names get one A record; anything else gets
/// NXDOMAIN. Returns `None` for packets that do not parse.
pub fn handle_dns_packet(records: &DnsRecords, query_bytes: &[u8], ttl: u32) -> Option<Vec<u8>> {
    let query = Packet::parse(query_bytes).ok()?;
    let question = query.questions.first()?;

    let qname = question.qname.to_string();
    let is_a = matches!(question.qtype, QTYPE::TYPE(TYPE::A));

    let mut response = query.into_reply();
    response.set_flags(PacketFlag::AUTHORITATIVE_ANSWER);

    if is_a && let Some(vpn_ip) = records.query(&qname) {
        let record = ResourceRecord::new(
            Name::new_unchecked(&qname).into_owned(),
            CLASS::IN,
            ttl,
            RData::A(A::from(vpn_ip)),
        );
        response.answers.push(record);
        return response.build_bytes_vec_compressed().ok();
    }

    *response.rcode_mut() = RCODE::NameError;
    response.build_bytes_vec_compressed().ok()
}

/// Serve `records` on `socket` until shutdown.
pub async fn run_dns_responder(
    socket: UdpSocket,
    records: Arc<DnsRecords>,
    ttl: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 512]; // Standard DNS UDP max

    loop {
        let (len, src) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "DNS socket recv error");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match handle_dns_packet(&records, &buf[..len], ttl) {
            Some(response) => {
                if let Err(e) = socket.send_to(&response, src).await {
                    debug!(error = %e, "DNS send error");
                }
            }
            None => debug!(len, "Failed to parse DNS query, dropping"),
        }
    }

    debug!("DNS responder stopped");
}
