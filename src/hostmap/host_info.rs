//! Per-Peer Record
//!
//! A `HostInfo` tracks everything known about one remote peer: where it can
//! be reached, how far the handshake has progressed, application packets
//! waiting for the tunnel, and the opaque session state once negotiated.
//!
//! Records are shared as `Arc<HostInfo>` between the registries and the
//! packet paths. Each field group carries its own lock, independent of any
//! `HostMap` lock, so a record can be mutated while it is reachable only
//! through one of its index keys.

use super::HostMapError;
use super::connection::ConnectionState;
use crate::cert::Certificate;
use crate::cidr::{Cidr, CidrTree};
use crate::endpoint::Endpoint;
use crate::header::{MessageSubType, MessageType};
use crate::lighthouse::Lighthouse;
use crate::transport::MessageSender;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Run the endpoint promotion check once every this many sends.
pub const PROMOTE_EVERY: u32 = 1000;

/// Maximum number of candidate endpoints kept per peer.
pub const MAX_REMOTES: usize = 10;

/// Window during which roaming back to the previous endpoint is ignored.
pub const ROAMING_SUPPRESS: Duration = Duration::from_secs(2);

/// Maximum number of application packets buffered during a handshake.
pub const MAX_CACHED_PACKETS: usize = 100;

/// Consecutive receive errors tolerated before the tunnel is considered broken.
pub const MAX_RECV_ERRORS: u32 = 3;

/// Replays one buffered packet once the tunnel is up.
pub type PacketCallback = Box<dyn FnOnce(&HostInfo, MessageType, MessageSubType, &[u8]) + Send>;

/// Process-unique identity of a `HostInfo`.
///
/// Registries key their slots by this id, so "the same record" is decided
/// by id equality rather than by pointer comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(u64);

impl SlotId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SlotId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Result of feeding an observed source endpoint to `handle_roaming`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoamOutcome {
    /// Same endpoint as the active one, or no active endpoint yet.
    Unchanged,
    /// Switching back to the endpoint we just left; ignored for now.
    Suppressed,
    /// Active endpoint switched.
    Roamed,
}

struct CachedPacket {
    message_type: MessageType,
    message_sub_type: MessageSubType,
    packet: Vec<u8>,
    callback: PacketCallback,
}

#[derive(Debug, Default)]
struct RemoteState {
    remote: Option<Endpoint>,
    remotes: Vec<Endpoint>,
    /// Endpoints that answered as a different peer.
    bad_remotes: Vec<Endpoint>,
    last_roam: Option<Instant>,
    last_roam_remote: Option<Endpoint>,
}

impl RemoteState {
    fn add(&mut self, remote: Endpoint) -> Option<Endpoint> {
        if self.bad_remotes.contains(&remote) {
            return self.remote;
        }
        if self.remotes.contains(&remote) {
            return Some(remote);
        }
        if self.remotes.len() >= MAX_REMOTES {
            let excess = self.remotes.len() + 1 - MAX_REMOTES;
            self.remotes.drain(..excess);
        }
        self.remotes.push(remote);
        Some(remote)
    }

    fn best(&self, preferred_ranges: &[Cidr]) -> Option<(Endpoint, bool)> {
        let mut public = None;
        for remote in &self.remotes {
            if in_ranges(preferred_ranges, remote) {
                return Some((*remote, true));
            }
            if public.is_none() && !remote.is_private() {
                public = Some(*remote);
            }
        }
        public
            .or_else(|| self.remotes.first().copied())
            .map(|remote| (remote, false))
    }
}

#[derive(Default)]
struct HandshakeProgress {
    started_at: Option<Instant>,
    attempts: u32,
    ready: bool,
    complete: bool,
    /// Last packet sent per handshake stage.
    packets: HashMap<u8, Vec<u8>>,
    packet_store: Vec<CachedPacket>,
}

fn in_ranges(ranges: &[Cidr], remote: &Endpoint) -> bool {
    let ip = remote.ip();
    ranges.iter().any(|range| range.contains(&ip))
}

/// Runtime record for one remote peer.
pub struct HostInfo {
    slot: SlotId,
    vpn_ip: AtomicU32,
    local_index: AtomicU32,
    remote_index: AtomicU32,
    promote_counter: AtomicU32,
    recv_errors: AtomicU32,
    remotes: RwLock<RemoteState>,
    handshake: Mutex<HandshakeProgress>,
    connection: RwLock<Option<Arc<ConnectionState>>>,
    remote_cidr: RwLock<Option<CidrTree<()>>>,
}

impl HostInfo {
    /// Create an empty record for `vpn_ip`.
    pub fn new(vpn_ip: Ipv4Addr) -> Self {
        Self {
            slot: SlotId::next(),
            vpn_ip: AtomicU32::new(u32::from(vpn_ip)),
            local_index: AtomicU32::new(0),
            remote_index: AtomicU32::new(0),
            promote_counter: AtomicU32::new(0),
            recv_errors: AtomicU32::new(0),
            remotes: RwLock::new(RemoteState::default()),
            handshake: Mutex::new(HandshakeProgress::default()),
            connection: RwLock::new(None),
            remote_cidr: RwLock::new(None),
        }
    }

    /// Create a record with a bound session, for the handshake path.
    pub fn with_connection(vpn_ip: Ipv4Addr, cs: ConnectionState) -> Self {
        let info = Self::new(vpn_ip);
        info.bind_connection_state(cs);
        info
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    // === Identity ===

    /// Overlay IP of the peer.
    pub fn vpn_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.vpn_ip.load(Ordering::Acquire))
    }

    pub fn set_vpn_ip(&self, vpn_ip: Ipv4Addr) {
        self.vpn_ip.store(u32::from(vpn_ip), Ordering::Release);
    }

    /// Index we chose for this tunnel; 0 until allocated.
    pub fn local_index(&self) -> u32 {
        self.local_index.load(Ordering::Acquire)
    }

    pub fn set_local_index(&self, index: u32) {
        self.local_index.store(index, Ordering::Release);
    }

    /// Index the peer chose; 0 until learned.
    pub fn remote_index(&self) -> u32 {
        self.remote_index.load(Ordering::Acquire)
    }

    pub fn set_remote_index(&self, index: u32) {
        self.remote_index.store(index, Ordering::Release);
    }

    // === Endpoints ===

    /// Active endpoint.
    pub fn remote(&self) -> Option<Endpoint> {
        self.remotes.read().remote
    }

    /// Copy of the candidate list, in insertion order.
    pub fn remotes(&self) -> Vec<Endpoint> {
        self.remotes.read().remotes.clone()
    }

    pub fn is_bad_remote(&self, remote: &Endpoint) -> bool {
        self.remotes.read().bad_remotes.contains(remote)
    }

    /// Add a candidate endpoint.
    ///
    /// Blacklisted endpoints are ignored and the active endpoint is
    /// returned instead. Duplicates return the existing entry. When the list
    /// is full the oldest candidates are dropped first.
    pub fn add_remote(&self, remote: Endpoint) -> Option<Endpoint> {
        self.remotes.write().add(remote)
    }

    /// Add a candidate and make it the active endpoint.
    pub fn set_remote(&self, remote: Endpoint) {
        let mut state = self.remotes.write();
        state.remote = state.add(remote);
    }

    /// Blacklist an endpoint and drop it from the candidates.
    pub fn block_remote(&self, remote: Endpoint) {
        let mut state = self.remotes.write();
        if !state.bad_remotes.contains(&remote) {
            state.bad_remotes.push(remote);
        }
        state.remotes.retain(|r| *r != remote);
    }

    /// Drop every candidate and the active endpoint.
    pub fn clear_remotes(&self) {
        let mut state = self.remotes.write();
        state.remote = None;
        state.remotes.clear();
    }

    /// Pick the best candidate.
    ///
    /// The first candidate inside a preferred range wins outright. Otherwise
    /// the first public candidate, falling back to the first candidate.
    pub fn select_best(&self, preferred_ranges: &[Cidr]) -> Option<(Endpoint, bool)> {
        self.remotes.read().best(preferred_ranges)
    }

    /// Make the best candidate active, if there is one.
    pub fn force_promote(&self, preferred_ranges: &[Cidr]) {
        let mut state = self.remotes.write();
        if let Some((best, _)) = state.best(preferred_ranges) {
            state.remote = Some(best);
        }
    }

    /// Rate-limited promotion check for the send path.
    ///
    /// Every `PROMOTE_EVERY` calls, if the active endpoint is not already in
    /// a preferred range, refresh candidates from the lighthouse cache and
    /// probe a better preferred candidate. The switch itself happens when
    /// the peer roams in response to the probe.
    pub fn periodically_promote(
        &self,
        preferred_ranges: &[Cidr],
        lighthouse: &dyn Lighthouse,
        sender: &dyn MessageSender,
    ) {
        let Some(active) = self.remote() else {
            self.force_promote(preferred_ranges);
            return;
        };

        let count = self.promote_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if count % PROMOTE_EVERY != 0 || in_ranges(preferred_ranges, &active) {
            return;
        }

        let candidates = lighthouse.query_cache(self.vpn_ip());
        let best = {
            let mut state = self.remotes.write();
            for candidate in candidates {
                state.add(candidate);
            }
            state.best(preferred_ranges)
        };

        if let Some((best, true)) = best
            && best != active
        {
            debug!(
                vpn_ip = %self.vpn_ip(),
                current = %active,
                candidate = %best,
                "Probing preferred endpoint"
            );
            sender.send_via(
                MessageType::Test,
                MessageSubType::TestRequest,
                self,
                &best,
                &[],
            );
        }
    }

    /// Advance the active endpoint to the next candidate, wrapping.
    pub fn rotate_remote(&self) {
        let mut state = self.remotes.write();
        let Some(first) = state.remotes.first().copied() else {
            return;
        };
        let next = state.remote.and_then(|current| {
            state
                .remotes
                .iter()
                .position(|r| *r == current)
                .and_then(|pos| state.remotes.get(pos + 1).copied())
        });
        state.remote = Some(next.unwrap_or(first));
    }

    /// React to traffic from `remote`.
    ///
    /// Moving back to the endpoint we roamed away from less than
    /// `ROAMING_SUPPRESS` ago is ignored to avoid flapping on packets that
    /// were already in flight.
    pub fn handle_roaming(&self, remote: Endpoint, now: Instant) -> RoamOutcome {
        let mut state = self.remotes.write();
        let Some(current) = state.remote else {
            return RoamOutcome::Unchanged;
        };
        if current == remote {
            return RoamOutcome::Unchanged;
        }
        if state.bad_remotes.contains(&remote) {
            debug!(vpn_ip = %self.vpn_ip(), remote = %remote, "Ignoring roam to blocked remote");
            return RoamOutcome::Unchanged;
        }

        if let Some(last_roam) = state.last_roam
            && state.last_roam_remote == Some(remote)
            && now.saturating_duration_since(last_roam) < ROAMING_SUPPRESS
        {
            debug!(
                vpn_ip = %self.vpn_ip(),
                remote = %remote,
                "Suppressing roam back to previous remote"
            );
            return RoamOutcome::Suppressed;
        }

        state.last_roam = Some(now);
        state.last_roam_remote = Some(current);
        state.remote = state.add(remote);
        drop(state);

        info!(
            vpn_ip = %self.vpn_ip(),
            from = %current,
            to = %remote,
            "Host roamed to new endpoint"
        );
        RoamOutcome::Roamed
    }

    // === Handshake progress ===

    /// Record the start of a handshake attempt. Keeps the first timestamp.
    pub fn mark_handshake_started(&self, now: Instant) {
        self.handshake.lock().started_at.get_or_insert(now);
    }

    pub fn handshake_started_at(&self) -> Option<Instant> {
        self.handshake.lock().started_at
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.handshake.lock().attempts
    }

    /// Count one more retry, returning the new total.
    pub fn increment_handshake_attempts(&self) -> u32 {
        let mut hs = self.handshake.lock();
        hs.attempts += 1;
        hs.attempts
    }

    pub fn is_handshake_ready(&self) -> bool {
        self.handshake.lock().ready
    }

    /// Mark the first handshake packet as built and ready to send.
    pub fn set_handshake_ready(&self, ready: bool) {
        self.handshake.lock().ready = ready;
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake.lock().complete
    }

    /// Store the packet sent for `stage`, replacing any previous one.
    pub fn set_handshake_packet(&self, stage: u8, packet: Vec<u8>) {
        self.handshake.lock().packets.insert(stage, packet);
    }

    pub fn handshake_packet(&self, stage: u8) -> Option<Vec<u8>> {
        self.handshake.lock().packets.get(&stage).cloned()
    }

    /// Packet of the furthest stage reached, for retransmission.
    pub fn last_handshake_packet(&self) -> Option<(u8, Vec<u8>)> {
        let hs = self.handshake.lock();
        hs.packets
            .iter()
            .max_by_key(|(stage, _)| **stage)
            .map(|(stage, packet)| (*stage, packet.clone()))
    }

    /// Buffer an application packet until the handshake completes.
    ///
    /// Returns false if the handshake is already complete or the buffer is
    /// full. New packets are dropped rather than evicting older ones.
    pub fn cache_packet(
        &self,
        message_type: MessageType,
        message_sub_type: MessageSubType,
        packet: &[u8],
        callback: PacketCallback,
    ) -> bool {
        let mut hs = self.handshake.lock();
        if hs.complete {
            return false;
        }
        let stored = hs.packet_store.len() < MAX_CACHED_PACKETS;
        if stored {
            hs.packet_store.push(CachedPacket {
                message_type,
                message_sub_type,
                packet: packet.to_vec(),
                callback,
            });
        }
        debug!(
            vpn_ip = %self.vpn_ip(),
            length = hs.packet_store.len(),
            stored,
            "Packet store"
        );
        stored
    }

    /// Number of packets waiting for the handshake.
    pub fn cached_packet_count(&self) -> usize {
        self.handshake.lock().packet_store.len()
    }

    /// Finish the handshake: replay buffered packets in submission order,
    /// clear the blacklist, and mark the session ready.
    pub fn handshake_complete(&self) {
        let stored = {
            let mut hs = self.handshake.lock();
            hs.complete = true;
            std::mem::take(&mut hs.packet_store)
        };

        let connection = self.connection_state();
        match &connection {
            Some(cs) => cs.set_message_counter(2),
            None => debug!(vpn_ip = %self.vpn_ip(), "Handshake complete without session state"),
        }

        debug!(
            vpn_ip = %self.vpn_ip(),
            count = stored.len(),
            "Sending stored packets"
        );
        for cp in stored {
            (cp.callback)(self, cp.message_type, cp.message_sub_type, &cp.packet);
        }

        self.remotes.write().bad_remotes.clear();
        if let Some(cs) = connection {
            cs.set_ready(true);
        }
    }

    // === Receive errors ===

    /// Count a bad packet from this peer.
    ///
    /// Fails once `MAX_RECV_ERRORS` have already been recorded; the caller
    /// should then tear the tunnel down.
    pub fn record_recv_error(&self) -> Result<(), HostMapError> {
        self.recv_errors
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_RECV_ERRORS).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| HostMapError::ReceiveErrorThresholdExceeded {
                vpn_ip: self.vpn_ip(),
            })
    }

    pub fn reset_recv_errors(&self) {
        self.recv_errors.store(0, Ordering::Release);
    }

    pub fn recv_errors(&self) -> u32 {
        self.recv_errors.load(Ordering::Acquire)
    }

    // === Session ===

    pub fn bind_connection_state(&self, cs: ConnectionState) {
        *self.connection.write() = Some(Arc::new(cs));
    }

    pub fn clear_connection_state(&self) {
        *self.connection.write() = None;
    }

    pub fn connection_state(&self) -> Option<Arc<ConnectionState>> {
        self.connection.read().clone()
    }

    /// The peer's certificate, once the session has verified it.
    pub fn peer_cert(&self) -> Option<Arc<Certificate>> {
        self.connection.read().as_ref().and_then(|cs| cs.peer_cert())
    }

    /// Build the subnet table for peers with several networks.
    ///
    /// Peers with a single overlay address and no subnets get no table.
    pub fn create_remote_cidr(&self, cert: &Certificate) {
        if !cert.has_multiple_networks() {
            return;
        }
        let mut tree = CidrTree::new();
        for ip in &cert.ips {
            tree.add(Cidr::host(ip.addr()), ());
        }
        for subnet in &cert.subnets {
            tree.add(*subnet, ());
        }
        *self.remote_cidr.write() = Some(tree);
    }

    /// Whether `ip` is one of the peer's advertised networks.
    ///
    /// Without a subnet table only the overlay IP itself matches.
    pub fn remote_cidr_contains(&self, ip: &IpAddr) -> bool {
        match self.remote_cidr.read().as_ref() {
            Some(tree) => tree.contains(ip),
            None => *ip == IpAddr::V4(self.vpn_ip()),
        }
    }

    /// Serializable view for control and debug output.
    pub fn snapshot(&self) -> HostInfoSnapshot {
        let (remote, remotes, bad_remotes, last_roam_remote) = {
            let state = self.remotes.read();
            (
                state.remote,
                state.remotes.clone(),
                state.bad_remotes.clone(),
                state.last_roam_remote,
            )
        };
        let (handshake_attempts, handshake_ready, handshake_complete, cached_packets) = {
            let hs = self.handshake.lock();
            (hs.attempts, hs.ready, hs.complete, hs.packet_store.len())
        };
        let connection = self.connection_state();

        HostInfoSnapshot {
            vpn_ip: self.vpn_ip(),
            local_index: self.local_index(),
            remote_index: self.remote_index(),
            remote,
            remotes,
            bad_remotes,
            promote_counter: self.promote_counter.load(Ordering::Relaxed),
            handshake_attempts,
            handshake_ready,
            handshake_complete,
            cached_packets,
            receive_errors: self.recv_errors(),
            last_roam_remote,
            connection_ready: connection.as_ref().is_some_and(|cs| cs.is_ready()),
            peer_names: connection
                .and_then(|cs| cs.peer_cert())
                .map(|cert| cert.names.clone())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Debug for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInfo")
            .field("slot", &self.slot)
            .field("vpn_ip", &self.vpn_ip())
            .field("local_index", &self.local_index())
            .field("remote_index", &self.remote_index())
            .field("remote", &self.remote())
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a `HostInfo`.
#[derive(Clone, Debug, Serialize)]
pub struct HostInfoSnapshot {
    pub vpn_ip: Ipv4Addr,
    pub local_index: u32,
    pub remote_index: u32,
    pub remote: Option<Endpoint>,
    pub remotes: Vec<Endpoint>,
    pub bad_remotes: Vec<Endpoint>,
    pub promote_counter: u32,
    pub handshake_attempts: u32,
    pub handshake_ready: bool,
    pub handshake_complete: bool,
    pub cached_packets: usize,
    pub receive_errors: u32,
    pub last_roam_remote: Option<Endpoint>,
    pub connection_ready: bool,
    pub peer_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lighthouse::AddressCache;
    use crate::transport::testing::RecordingSender;

    const PEER: Ipv4Addr = Ipv4Addr::new(172, 1, 1, 2);

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn local_range() -> Vec<Cidr> {
        vec!["10.1.1.0/24".parse().unwrap()]
    }

    #[test]
    fn test_slot_ids_unique() {
        let a = HostInfo::new(PEER);
        let b = HostInfo::new(PEER);
        assert_ne!(a.slot(), b.slot());
    }

    #[test]
    fn test_select_best_prefers_local_range() {
        let info = HostInfo::new(PEER);
        info.add_remote(ep("1.1.1.1:4242"));
        info.add_remote(ep("10.1.1.1:4242"));
        assert_eq!(
            info.select_best(&local_range()),
            Some((ep("10.1.1.1:4242"), true))
        );
    }

    #[test]
    fn test_select_best_public_only() {
        let info = HostInfo::new(PEER);
        info.add_remote(ep("1.1.1.1:4242"));
        assert_eq!(
            info.select_best(&local_range()),
            Some((ep("1.1.1.1:4242"), false))
        );
    }

    #[test]
    fn test_select_best_first_public_over_private() {
        let info = HostInfo::new(PEER);
        info.add_remote(ep("192.168.0.5:4242"));
        info.add_remote(ep("1.1.1.1:4242"));
        info.add_remote(ep("2.2.2.2:4242"));
        assert_eq!(
            info.select_best(&local_range()),
            Some((ep("1.1.1.1:4242"), false))
        );

        let private_only = HostInfo::new(PEER);
        private_only.add_remote(ep("192.168.0.5:4242"));
        private_only.add_remote(ep("172.16.0.5:4242"));
        assert_eq!(
            private_only.select_best(&[]),
            Some((ep("192.168.0.5:4242"), false))
        );

        assert_eq!(HostInfo::new(PEER).select_best(&local_range()), None);
    }

    #[test]
    fn test_force_promote() {
        let info = HostInfo::new(PEER);
        info.force_promote(&local_range());
        assert_eq!(info.remote(), None);

        info.add_remote(ep("1.1.1.1:4242"));
        info.add_remote(ep("10.1.1.9:4242"));
        info.force_promote(&local_range());
        assert_eq!(info.remote(), Some(ep("10.1.1.9:4242")));
    }

    #[test]
    fn test_add_remote_dedup_and_cap() {
        let info = HostInfo::new(PEER);
        for i in 0..15u8 {
            info.add_remote(Endpoint::v4(Ipv4Addr::new(1, 1, 1, i), 4242));
        }
        let remotes = info.remotes();
        assert_eq!(remotes.len(), MAX_REMOTES);
        // Oldest dropped first
        assert_eq!(remotes[0], Endpoint::v4(Ipv4Addr::new(1, 1, 1, 5), 4242));
        assert_eq!(remotes[9], Endpoint::v4(Ipv4Addr::new(1, 1, 1, 14), 4242));

        let dup = Endpoint::v4(Ipv4Addr::new(1, 1, 1, 7), 4242);
        assert_eq!(info.add_remote(dup), Some(dup));
        assert_eq!(info.remotes().len(), MAX_REMOTES);
    }

    #[test]
    fn test_block_remote() {
        let info = HostInfo::new(PEER);
        info.set_remote(ep("1.1.1.1:4242"));
        info.add_remote(ep("2.2.2.2:4242"));

        info.block_remote(ep("2.2.2.2:4242"));
        assert!(info.is_bad_remote(&ep("2.2.2.2:4242")));
        assert_eq!(info.remotes(), vec![ep("1.1.1.1:4242")]);

        // Blacklisted endpoints are never re-added
        assert_eq!(info.add_remote(ep("2.2.2.2:4242")), Some(ep("1.1.1.1:4242")));
        assert_eq!(info.remotes(), vec![ep("1.1.1.1:4242")]);
    }

    #[test]
    fn test_rotate_remote() {
        let info = HostInfo::new(PEER);
        info.rotate_remote();
        assert_eq!(info.remote(), None);

        info.add_remote(ep("1.1.1.1:1"));
        info.add_remote(ep("2.2.2.2:2"));
        info.add_remote(ep("3.3.3.3:3"));

        info.rotate_remote();
        assert_eq!(info.remote(), Some(ep("1.1.1.1:1")));
        info.rotate_remote();
        assert_eq!(info.remote(), Some(ep("2.2.2.2:2")));
        info.rotate_remote();
        assert_eq!(info.remote(), Some(ep("3.3.3.3:3")));
        info.rotate_remote();
        assert_eq!(info.remote(), Some(ep("1.1.1.1:1")));
    }

    #[test]
    fn test_clear_remotes() {
        let info = HostInfo::new(PEER);
        info.set_remote(ep("1.1.1.1:1"));
        info.clear_remotes();
        assert_eq!(info.remote(), None);
        assert!(info.remotes().is_empty());
    }

    #[test]
    fn test_replay_buffer_bounded_and_fifo() {
        let info = HostInfo::with_connection(PEER, ConnectionState::new(true));
        let replayed = Arc::new(Mutex::new(Vec::new()));

        for i in 0..=MAX_CACHED_PACKETS {
            let replayed = replayed.clone();
            let stored = info.cache_packet(
                MessageType::Message,
                MessageSubType::None,
                &(i as u32).to_be_bytes(),
                Box::new(move |_, _, _, packet| replayed.lock().push(packet.to_vec())),
            );
            assert_eq!(stored, i < MAX_CACHED_PACKETS);
        }
        assert_eq!(info.cached_packet_count(), MAX_CACHED_PACKETS);

        info.handshake_complete();

        let replayed = replayed.lock();
        assert_eq!(replayed.len(), MAX_CACHED_PACKETS);
        for (i, packet) in replayed.iter().enumerate() {
            assert_eq!(packet, &(i as u32).to_be_bytes().to_vec());
        }
        assert_eq!(info.cached_packet_count(), 0);
        assert!(info.is_handshake_complete());

        // Nothing is buffered once complete
        assert!(!info.cache_packet(
            MessageType::Message,
            MessageSubType::None,
            b"late",
            Box::new(|_, _, _, _| {}),
        ));
    }

    #[test]
    fn test_handshake_complete_readies_connection() {
        let info = HostInfo::with_connection(PEER, ConnectionState::new(true));
        info.set_remote(ep("1.1.1.1:1"));
        info.block_remote(ep("2.2.2.2:2"));

        info.handshake_complete();

        let cs = info.connection_state().unwrap();
        assert!(cs.is_ready());
        assert_eq!(cs.message_counter(), 2);
        assert!(!info.is_bad_remote(&ep("2.2.2.2:2")));
    }

    #[test]
    fn test_handshake_packets() {
        let info = HostInfo::new(PEER);
        assert!(info.last_handshake_packet().is_none());

        info.set_handshake_packet(0, vec![0]);
        info.set_handshake_packet(2, vec![2, 2]);
        info.set_handshake_packet(1, vec![1]);
        assert_eq!(info.last_handshake_packet(), Some((2, vec![2, 2])));
        assert_eq!(info.handshake_packet(0), Some(vec![0]));
        assert_eq!(info.handshake_packet(3), None);

        assert_eq!(info.increment_handshake_attempts(), 1);
        assert_eq!(info.increment_handshake_attempts(), 2);
        assert_eq!(info.handshake_attempts(), 2);
    }

    #[test]
    fn test_mark_handshake_started_keeps_first() {
        let info = HostInfo::new(PEER);
        let t0 = Instant::now();
        info.mark_handshake_started(t0);
        info.mark_handshake_started(t0 + Duration::from_secs(5));
        assert_eq!(info.handshake_started_at(), Some(t0));
    }

    #[test]
    fn test_recv_error_threshold() {
        let info = HostInfo::new(PEER);
        for _ in 0..MAX_RECV_ERRORS {
            info.record_recv_error().unwrap();
        }
        let err = info.record_recv_error().unwrap_err();
        assert!(matches!(
            err,
            HostMapError::ReceiveErrorThresholdExceeded { vpn_ip } if vpn_ip == PEER
        ));

        info.reset_recv_errors();
        assert!(info.record_recv_error().is_ok());
    }

    #[test]
    fn test_handle_roaming() {
        let info = HostInfo::new(PEER);
        let t0 = Instant::now();
        let a = ep("1.1.1.1:1");
        let b = ep("2.2.2.2:2");

        assert_eq!(info.handle_roaming(a, t0), RoamOutcome::Unchanged);
        info.set_remote(a);
        assert_eq!(info.handle_roaming(a, t0), RoamOutcome::Unchanged);

        assert_eq!(info.handle_roaming(b, t0), RoamOutcome::Roamed);
        assert_eq!(info.remote(), Some(b));

        // Flapping back right away is ignored
        let soon = t0 + Duration::from_millis(500);
        assert_eq!(info.handle_roaming(a, soon), RoamOutcome::Suppressed);
        assert_eq!(info.remote(), Some(b));

        let later = t0 + ROAMING_SUPPRESS + Duration::from_millis(1);
        assert_eq!(info.handle_roaming(a, later), RoamOutcome::Roamed);
        assert_eq!(info.remote(), Some(a));
    }

    #[test]
    fn test_handle_roaming_ignores_blocked_remote() {
        let info = HostInfo::new(PEER);
        let t0 = Instant::now();
        let a = ep("1.1.1.1:1");
        let b = ep("2.2.2.2:2");
        info.set_remote(a);
        info.block_remote(b);

        assert_eq!(info.handle_roaming(b, t0), RoamOutcome::Unchanged);
        assert_eq!(info.remote(), Some(a));

        let snap = info.snapshot();
        assert_eq!(snap.last_roam_remote, None);
        assert!(!snap.remotes.contains(&b));
    }

    #[test]
    fn test_periodically_promote_probes_preferred() {
        let info = HostInfo::new(PEER);
        let lighthouse = AddressCache::new();
        let sender = RecordingSender::default();
        let ranges = local_range();

        // No active endpoint: behaves like force_promote
        info.add_remote(ep("1.1.1.1:4242"));
        info.periodically_promote(&ranges, &lighthouse, &sender);
        assert_eq!(info.remote(), Some(ep("1.1.1.1:4242")));

        lighthouse.add_remote(PEER, ep("10.1.1.7:4242"));
        for _ in 0..PROMOTE_EVERY - 1 {
            info.periodically_promote(&ranges, &lighthouse, &sender);
        }
        assert!(sender.via().is_empty());

        info.periodically_promote(&ranges, &lighthouse, &sender);
        let probes = sender.via();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, MessageType::Test);
        assert_eq!(probes[0].1, MessageSubType::TestRequest);
        assert_eq!(probes[0].2, ep("10.1.1.7:4242"));

        // Probe only; the active endpoint does not move
        assert_eq!(info.remote(), Some(ep("1.1.1.1:4242")));
        assert!(info.remotes().contains(&ep("10.1.1.7:4242")));
    }

    #[test]
    fn test_periodically_promote_skips_when_already_preferred() {
        let info = HostInfo::new(PEER);
        let lighthouse = AddressCache::new();
        let sender = RecordingSender::default();
        let ranges = local_range();

        info.set_remote(ep("10.1.1.1:4242"));
        lighthouse.add_remote(PEER, ep("10.1.1.2:4242"));
        for _ in 0..PROMOTE_EVERY {
            info.periodically_promote(&ranges, &lighthouse, &sender);
        }
        assert!(sender.via().is_empty());
        assert_eq!(info.remotes(), vec![ep("10.1.1.1:4242")]);
    }

    #[test]
    fn test_remote_cidr() {
        let info = HostInfo::new(PEER);
        let simple = Certificate {
            ips: vec![Cidr::host(IpAddr::V4(PEER))],
            ..Default::default()
        };
        info.create_remote_cidr(&simple);
        assert!(info.remote_cidr_contains(&IpAddr::V4(PEER)));
        assert!(!info.remote_cidr_contains(&"192.168.5.1".parse().unwrap()));

        let routed = Certificate {
            ips: vec![Cidr::host(IpAddr::V4(PEER))],
            subnets: vec!["192.168.5.0/24".parse().unwrap()],
            ..Default::default()
        };
        info.create_remote_cidr(&routed);
        assert!(info.remote_cidr_contains(&IpAddr::V4(PEER)));
        assert!(info.remote_cidr_contains(&"192.168.5.1".parse().unwrap()));
        assert!(!info.remote_cidr_contains(&"172.1.1.3".parse().unwrap()));
    }

    #[test]
    fn test_snapshot_serializes() {
        let cert = Certificate {
            names: vec!["host2".to_string()],
            ..Default::default()
        };
        let info = HostInfo::with_connection(PEER, ConnectionState::new(true).with_peer_cert(cert));
        info.set_local_index(7);
        info.set_remote(ep("1.1.1.1:4242"));

        let snap = info.snapshot();
        assert_eq!(snap.local_index, 7);
        assert_eq!(snap.remote, Some(ep("1.1.1.1:4242")));
        assert_eq!(snap.peer_names, vec!["host2".to_string()]);
        assert!(!snap.connection_ready);

        let yaml = serde_yaml::to_string(&snap).unwrap();
        assert!(yaml.contains("vpn_ip:"));
        assert!(yaml.contains("172.1.1.2"));
        assert!(yaml.contains("host2"));
    }
}
