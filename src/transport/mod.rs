//! Transport Seams
//!
//! Traits for the two ways this core puts bytes on the wire:
//!
//! - `Outside`: raw writes of an opaque buffer to an underlay endpoint
//!   (handshake retransmits, keepalive punches)
//! - `MessageSender`: typed sends toward a peer by overlay IP, which the
//!   record layer encrypts and frames
//!
//! `udp::UdpOutside` implements `Outside` over a tokio socket.
//! `OutsideSender` is a `MessageSender` that hands already-framed payloads
//! straight to an `Outside`.

pub mod udp;

use crate::endpoint::Endpoint;
use crate::header::{MessageSubType, MessageType};
use crate::hostmap::{HostInfo, HostMap};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Largest packet the record layer will produce.
pub const MTU: usize = 9001;

/// Errors related to transport setup.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid bind address '{addr}': {reason}")]
    InvalidBindAddr { addr: String, reason: String },

    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Raw underlay writer.
pub trait Outside: Send + Sync {
    /// Write `buf` to `addr` without blocking.
    fn write_to(&self, buf: &[u8], addr: &Endpoint) -> io::Result<()>;
}

/// Typed sender toward peers, implemented by the record layer.
///
/// `nb` and `out` are caller-provided scratch buffers (nonce and output)
/// so the hot path does not allocate per packet.
pub trait MessageSender: Send + Sync {
    /// Send to the tunnel for `vpn_ip`.
    fn send_message_to_vpn_ip(
        &self,
        t: MessageType,
        st: MessageSubType,
        vpn_ip: Ipv4Addr,
        payload: &[u8],
        nb: &mut [u8],
        out: &mut [u8],
    );

    /// Send to every known endpoint of `vpn_ip`.
    fn send_message_to_all(
        &self,
        t: MessageType,
        st: MessageSubType,
        vpn_ip: Ipv4Addr,
        payload: &[u8],
        nb: &mut [u8],
        out: &mut [u8],
    );

    /// Send on behalf of `host` to one specific endpoint, bypassing its
    /// active remote (probes and first-stage handshakes).
    fn send_via(
        &self,
        t: MessageType,
        st: MessageSubType,
        host: &HostInfo,
        remote: &Endpoint,
        payload: &[u8],
    );
}

/// Sender that writes already-framed payloads to a peer's endpoints
/// through an `Outside`.
pub struct OutsideSender {
    outside: Arc<dyn Outside>,
    hostmap: Arc<HostMap>,
}

impl OutsideSender {
    pub fn new(outside: Arc<dyn Outside>, hostmap: Arc<HostMap>) -> Self {
        Self { outside, hostmap }
    }

    fn write(&self, t: MessageType, payload: &[u8], remote: &Endpoint) {
        if let Err(e) = self.outside.write_to(payload, remote) {
            debug!(
                message_type = %t,
                remote = %remote,
                error = %e,
                "Failed to write packet"
            );
        }
    }
}

impl MessageSender for OutsideSender {
    fn send_message_to_vpn_ip(
        &self,
        t: MessageType,
        _st: MessageSubType,
        vpn_ip: Ipv4Addr,
        payload: &[u8],
        _nb: &mut [u8],
        _out: &mut [u8],
    ) {
        match self.hostmap.get_by_ip(vpn_ip).ok().and_then(|h| h.remote()) {
            Some(remote) => self.write(t, payload, &remote),
            None => debug!(vpn_ip = %vpn_ip, message_type = %t, "No remote for send"),
        }
    }

    fn send_message_to_all(
        &self,
        t: MessageType,
        _st: MessageSubType,
        vpn_ip: Ipv4Addr,
        payload: &[u8],
        _nb: &mut [u8],
        _out: &mut [u8],
    ) {
        let remotes = match self.hostmap.get_by_ip(vpn_ip) {
            Ok(host) => host.remotes(),
            Err(_) => {
                debug!(vpn_ip = %vpn_ip, message_type = %t, "No host for broadcast");
                return;
            }
        };
        for remote in &remotes {
            self.write(t, payload, remote);
        }
    }

    fn send_via(
        &self,
        t: MessageType,
        _st: MessageSubType,
        _host: &HostInfo,
        remote: &Endpoint,
        payload: &[u8],
    ) {
        self.write(t, payload, remote);
    }
}
