//! Peer Registry
//!
//! A `HostMap` indexes `HostInfo` records three ways: by overlay IP, by the
//! local index we chose, and by the remote index the peer chose. One node
//! has a single main map for established tunnels; the handshake manager
//! owns two more for attempts still in progress.
//!
//! Records live in slots keyed by `SlotId`. The three indices map keys to
//! slot ids, and each slot remembers which keys point at it, so teardown
//! removes exactly the entries of one record. A slot with no keys left is
//! dropped.
//!
//! Lock order: the map lock may be held while touching a `HostInfo`, never
//! the reverse. Collaborators (sender, lighthouse, socket) are only called
//! after the map lock is released.

mod connection;
mod host_info;

pub use connection::ConnectionState;
pub use host_info::{
    HostInfo, HostInfoSnapshot, MAX_CACHED_PACKETS, MAX_RECV_ERRORS, MAX_REMOTES, PROMOTE_EVERY,
    PacketCallback, ROAMING_SUPPRESS, RoamOutcome, SlotId,
};

use crate::cidr::{Cidr, CidrTree};
use crate::endpoint::Endpoint;
use crate::lighthouse::Lighthouse;
use crate::transport::{MessageSender, Outside};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Errors from registry lookups and per-peer bookkeeping.
#[derive(Debug, Error)]
pub enum HostMapError {
    #[error("vpn ip {vpn_ip} not found in {map} hostmap")]
    VpnIpNotFound { map: String, vpn_ip: Ipv4Addr },

    #[error("index {index} not found in {map} hostmap")]
    IndexNotFound { map: String, index: u32 },

    #[error("remote index {index} not found in {map} hostmap")]
    RemoteIndexNotFound { map: String, index: u32 },

    #[error("receive error threshold exceeded for {vpn_ip}")]
    ReceiveErrorThresholdExceeded { vpn_ip: Ipv4Addr },
}

impl HostMapError {
    /// True for lookup misses, which callers treat as "no such peer".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HostMapError::VpnIpNotFound { .. }
                | HostMapError::IndexNotFound { .. }
                | HostMapError::RemoteIndexNotFound { .. }
        )
    }
}

/// Static route for a network reachable through an overlay peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsafeRoute {
    pub route: Cidr,
    pub via: Ipv4Addr,
}

/// Entry counts for one map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HostMapStats {
    pub hosts: usize,
    pub indexes: usize,
    pub remote_indexes: usize,
    /// Keepalives written by `punch` since the map was created.
    pub punches_sent: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IndexKind {
    Host = 0,
    Local = 1,
    Remote = 2,
}

struct Slot {
    info: Arc<HostInfo>,
    /// Key under which this slot is registered, per index.
    keys: [Option<u32>; 3],
}

struct Registry {
    slots: HashMap<SlotId, Slot>,
    indices: [HashMap<u32, SlotId>; 3],
    default_route: Option<Ipv4Addr>,
    unsafe_routes: CidrTree<Ipv4Addr>,
}

impl Registry {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            indices: [HashMap::new(), HashMap::new(), HashMap::new()],
            default_route: None,
            unsafe_routes: CidrTree::new(),
        }
    }

    fn lookup(&self, kind: IndexKind, key: u32) -> Option<&Arc<HostInfo>> {
        self.indices[kind as usize]
            .get(&key)
            .and_then(|id| self.slots.get(id))
            .map(|slot| &slot.info)
    }

    fn contains(&self, kind: IndexKind, key: u32) -> bool {
        self.indices[kind as usize].contains_key(&key)
    }

    /// Point `key` at `info`, displacing any other record registered under
    /// it and any other key this record held in the same index.
    fn register(&mut self, kind: IndexKind, key: u32, info: &Arc<HostInfo>) {
        let k = kind as usize;
        let id = info.slot();

        if let Some(prev) = self.indices[k].insert(key, id)
            && prev != id
        {
            self.release(prev, kind);
        }

        let slot = self.slots.entry(id).or_insert_with(|| Slot {
            info: info.clone(),
            keys: [None; 3],
        });
        if let Some(old) = slot.keys[k].replace(key)
            && old != key
            && self.indices[k].get(&old) == Some(&id)
        {
            self.indices[k].remove(&old);
        }
    }

    /// Drop one key from a slot, dropping the slot once it has none left.
    fn release(&mut self, id: SlotId, kind: IndexKind) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.keys[kind as usize] = None;
            if slot.keys.iter().all(Option::is_none) {
                self.slots.remove(&id);
            }
        }
    }

    fn unregister(&mut self, kind: IndexKind, key: u32) -> Option<Arc<HostInfo>> {
        let id = self.indices[kind as usize].remove(&key)?;
        let info = self.slots.get(&id).map(|slot| slot.info.clone());
        self.release(id, kind);
        info
    }

    /// Remove a slot and every index entry that points at it.
    fn purge(&mut self, id: SlotId) -> Option<Arc<HostInfo>> {
        let slot = self.slots.remove(&id)?;
        for (k, key) in slot.keys.iter().enumerate() {
            if let Some(key) = key
                && self.indices[k].get(key) == Some(&id)
            {
                self.indices[k].remove(key);
            }
        }
        Some(slot.info)
    }

    fn purge_by(&mut self, kind: IndexKind, key: u32) -> Option<Arc<HostInfo>> {
        let id = *self.indices[kind as usize].get(&key)?;
        self.purge(id)
    }

    /// Tear down a different record still registered under `info`'s
    /// overlay IP.
    fn sweep_stale(&mut self, info: &HostInfo) -> Option<Arc<HostInfo>> {
        let ip = u32::from(info.vpn_ip());
        if ip == 0 {
            return None;
        }
        match self.indices[IndexKind::Host as usize].get(&ip) {
            Some(&other) if other != info.slot() => self.purge(other),
            _ => None,
        }
    }

    fn stats(&self) -> HostMapStats {
        HostMapStats {
            hosts: self.indices[IndexKind::Host as usize].len(),
            indexes: self.indices[IndexKind::Local as usize].len(),
            remote_indexes: self.indices[IndexKind::Remote as usize].len(),
            punches_sent: 0,
        }
    }
}

/// Registry of peer records, indexed by overlay IP, local index and
/// remote index.
pub struct HostMap {
    name: String,
    vpn_cidr: Option<Cidr>,
    preferred_ranges: Vec<Cidr>,
    registry: RwLock<Registry>,
    punches_sent: AtomicU64,
}

impl HostMap {
    /// Create an empty map.
    pub fn new(name: impl Into<String>, vpn_cidr: Option<Cidr>, preferred_ranges: Vec<Cidr>) -> Self {
        Self {
            name: name.into(),
            vpn_cidr,
            preferred_ranges,
            registry: RwLock::new(Registry::new()),
            punches_sent: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vpn_cidr(&self) -> Option<Cidr> {
        self.vpn_cidr
    }

    /// Local network ranges that win endpoint selection.
    pub fn preferred_ranges(&self) -> &[Cidr] {
        &self.preferred_ranges
    }

    // === Lookups ===

    pub fn get_by_ip(&self, vpn_ip: Ipv4Addr) -> Result<Arc<HostInfo>, HostMapError> {
        self.registry
            .read()
            .lookup(IndexKind::Host, u32::from(vpn_ip))
            .cloned()
            .ok_or_else(|| HostMapError::VpnIpNotFound {
                map: self.name.clone(),
                vpn_ip,
            })
    }

    pub fn get_by_local_index(&self, index: u32) -> Result<Arc<HostInfo>, HostMapError> {
        self.registry
            .read()
            .lookup(IndexKind::Local, index)
            .cloned()
            .ok_or_else(|| HostMapError::IndexNotFound {
                map: self.name.clone(),
                index,
            })
    }

    pub fn get_by_remote_index(&self, index: u32) -> Result<Arc<HostInfo>, HostMapError> {
        self.registry
            .read()
            .lookup(IndexKind::Remote, index)
            .cloned()
            .ok_or_else(|| HostMapError::RemoteIndexNotFound {
                map: self.name.clone(),
                index,
            })
    }

    /// Local index of the record registered for `vpn_ip`.
    pub fn index_by_ip(&self, vpn_ip: Ipv4Addr) -> Result<u32, HostMapError> {
        self.get_by_ip(vpn_ip).map(|info| info.local_index())
    }

    /// Lookup for the send path: also runs the rate-limited endpoint
    /// promotion check on the found record.
    pub fn query_with_promotion(
        &self,
        vpn_ip: Ipv4Addr,
        lighthouse: &dyn Lighthouse,
        sender: &dyn MessageSender,
    ) -> Result<Arc<HostInfo>, HostMapError> {
        let info = self.get_by_ip(vpn_ip)?;
        info.periodically_promote(&self.preferred_ranges, lighthouse, sender);
        Ok(info)
    }

    pub fn contains_vpn_ip(&self, vpn_ip: Ipv4Addr) -> bool {
        self.registry
            .read()
            .contains(IndexKind::Host, u32::from(vpn_ip))
    }

    pub fn contains_local_index(&self, index: u32) -> bool {
        self.registry.read().contains(IndexKind::Local, index)
    }

    pub fn contains_remote_index(&self, index: u32) -> bool {
        self.registry.read().contains(IndexKind::Remote, index)
    }

    /// Number of records, however they are indexed. `stats().hosts`
    /// counts only those registered by overlay IP.
    pub fn len(&self) -> usize {
        self.registry.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().slots.is_empty()
    }

    /// Every record in the map, however it is indexed.
    pub fn hosts(&self) -> Vec<Arc<HostInfo>> {
        self.registry
            .read()
            .slots
            .values()
            .map(|slot| slot.info.clone())
            .collect()
    }

    // === Insertion ===

    /// Get the record for `vpn_ip`, creating an empty one if absent.
    pub fn insert_by_ip(&self, vpn_ip: Ipv4Addr) -> Arc<HostInfo> {
        let key = u32::from(vpn_ip);
        let existing = self.registry.read().lookup(IndexKind::Host, key).cloned();
        if let Some(info) = existing {
            return info;
        }

        let mut reg = self.registry.write();
        if let Some(info) = reg.lookup(IndexKind::Host, key) {
            return info.clone();
        }
        let info = Arc::new(HostInfo::new(vpn_ip));
        reg.register(IndexKind::Host, key, &info);
        let total = reg.stats().hosts;
        drop(reg);

        debug!(
            map = %self.name,
            vpn_ip = %vpn_ip,
            total,
            "Hostmap vpn ip added"
        );
        info
    }

    /// Register `info` under its overlay IP and both indices at once.
    ///
    /// A different record still registered under the same overlay IP is
    /// swept from every index first. Zero indices and an unspecified
    /// overlay IP mean "not yet known" and are not registered.
    pub fn insert_full(&self, info: &Arc<HostInfo>) {
        let vpn_ip = info.vpn_ip();
        let local = info.local_index();
        let remote = info.remote_index();

        let (stale, total) = {
            let mut reg = self.registry.write();
            let stale = reg.sweep_stale(info);
            if !vpn_ip.is_unspecified() {
                reg.register(IndexKind::Host, u32::from(vpn_ip), info);
            }
            if local != 0 {
                reg.register(IndexKind::Local, local, info);
            }
            if remote != 0 {
                reg.register(IndexKind::Remote, remote, info);
            }
            (stale, reg.stats().hosts)
        };

        if let Some(stale) = stale {
            debug!(
                map = %self.name,
                vpn_ip = %vpn_ip,
                stale_index = stale.local_index(),
                "Hostmap superseded stale record"
            );
        }
        debug!(
            map = %self.name,
            vpn_ip = %vpn_ip,
            local_index = local,
            remote_index = remote,
            total,
            "Hostmap host added"
        );
    }

    /// Set the overlay IP of `info` and register it fully.
    pub fn insert_ip_host_info(&self, vpn_ip: Ipv4Addr, info: &Arc<HostInfo>) {
        info.set_vpn_ip(vpn_ip);
        self.insert_full(info);
    }

    /// Register `info` under a local index if that index is free.
    ///
    /// On success the index is also recorded on the record.
    pub fn insert_local_index(&self, index: u32, info: &Arc<HostInfo>) -> bool {
        let mut reg = self.registry.write();
        if reg.contains(IndexKind::Local, index) {
            return false;
        }
        info.set_local_index(index);
        reg.register(IndexKind::Local, index, info);
        true
    }

    /// Register `info` under the index the peer chose.
    pub fn insert_remote_index(&self, index: u32, info: &Arc<HostInfo>) {
        {
            let mut reg = self.registry.write();
            info.set_remote_index(index);
            reg.register(IndexKind::Remote, index, info);
        }
        debug!(
            map = %self.name,
            remote_index = index,
            vpn_ip = %info.vpn_ip(),
            "Hostmap remote index added"
        );
    }

    // === Removal ===

    /// Drop only the overlay-IP entry for `vpn_ip`.
    pub fn remove_by_ip(&self, vpn_ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        let removed = self
            .registry
            .write()
            .unregister(IndexKind::Host, u32::from(vpn_ip));
        debug!(map = %self.name, vpn_ip = %vpn_ip, "Hostmap vpn ip deleted");
        removed
    }

    /// Remove the record registered under a local index, with all of its
    /// other entries.
    pub fn remove_by_local_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        let removed = self.registry.write().purge_by(IndexKind::Local, index);
        debug!(map = %self.name, index, removed = removed.is_some(), "Hostmap index deleted");
        removed
    }

    /// Remove the record registered under a remote index, with all of its
    /// other entries.
    pub fn remove_by_remote_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        let removed = self.registry.write().purge_by(IndexKind::Remote, index);
        debug!(
            map = %self.name,
            index,
            removed = removed.is_some(),
            "Hostmap remote index deleted"
        );
        removed
    }

    /// Tear down `info` everywhere in this map.
    ///
    /// A different record registered under the same overlay IP is torn
    /// down first. Returns whether `info` itself was present.
    pub fn remove(&self, info: &HostInfo) -> bool {
        let (stale, removed) = {
            let mut reg = self.registry.write();
            let stale = reg.sweep_stale(info);
            (stale, reg.purge(info.slot()).is_some())
        };
        debug!(
            map = %self.name,
            vpn_ip = %info.vpn_ip(),
            index = info.local_index(),
            remote_index = info.remote_index(),
            stale = stale.is_some(),
            removed,
            "Hostmap host deleted"
        );
        removed
    }

    // === Endpoints ===

    /// Add a candidate endpoint for `vpn_ip`, creating the record if
    /// needed, and re-run endpoint selection.
    pub fn add_remote(&self, vpn_ip: Ipv4Addr, remote: Endpoint) -> Arc<HostInfo> {
        let info = self.insert_by_ip(vpn_ip);
        info.add_remote(remote);
        info.force_promote(&self.preferred_ranges);
        info
    }

    /// Forget every endpoint of `vpn_ip` without removing the record.
    pub fn clear_remotes(&self, vpn_ip: Ipv4Addr) {
        if let Ok(info) = self.get_by_ip(vpn_ip) {
            info.clear_remotes();
        }
    }

    /// Every candidate endpoint of every peer.
    pub fn punch_list(&self) -> Vec<Endpoint> {
        let hosts: Vec<Arc<HostInfo>> = {
            let reg = self.registry.read();
            reg.indices[IndexKind::Host as usize]
                .values()
                .filter_map(|id| reg.slots.get(id))
                .map(|slot| slot.info.clone())
                .collect()
        };
        hosts.iter().flat_map(|info| info.remotes()).collect()
    }

    /// Write a one-byte keepalive to every punch-list endpoint.
    pub fn punch(&self, outside: &dyn Outside) -> usize {
        let mut sent = 0;
        for remote in self.punch_list() {
            match outside.write_to(&[1], &remote) {
                Ok(()) => sent += 1,
                Err(e) => trace!(remote = %remote, error = %e, "Punch failed"),
            }
        }
        self.punches_sent.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Keep NAT mappings open by punching every `interval` until shutdown.
    pub async fn punchy(
        self: Arc<Self>,
        outside: Arc<dyn Outside>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(map = %self.name, interval_secs = interval.as_secs(), "Punch loop started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let sent = self.punch(outside.as_ref());
                    trace!(map = %self.name, sent, "Punched endpoints");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(map = %self.name, "Punch loop stopped");
    }

    // === Routing ===

    pub fn set_default_route(&self, vpn_ip: Ipv4Addr) {
        self.registry.write().default_route = Some(vpn_ip);
    }

    pub fn default_route(&self) -> Option<Ipv4Addr> {
        self.registry.read().default_route
    }

    /// Install statically configured routes to networks behind peers.
    pub fn add_unsafe_routes(&self, routes: &[UnsafeRoute]) {
        let mut reg = self.registry.write();
        for r in routes {
            warn!(route = %r.route, via = %r.via, "Adding UNSAFE route");
            reg.unsafe_routes.add(r.route, r.via);
        }
    }

    /// Overlay next hop for `ip` from the most specific unsafe route.
    pub fn query_unsafe_route(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        self.registry
            .read()
            .unsafe_routes
            .most_specific_contains(&IpAddr::V4(ip))
            .copied()
    }

    // === Stats ===

    pub fn stats(&self) -> HostMapStats {
        HostMapStats {
            punches_sent: self.punches_sent.load(Ordering::Relaxed),
            ..self.registry.read().stats()
        }
    }

    /// Log entry counts.
    pub fn emit_stats(&self) {
        let stats = self.stats();
        debug!(
            map = %self.name,
            hosts = stats.hosts,
            indexes = stats.indexes,
            remote_indexes = stats.remote_indexes,
            punches_sent = stats.punches_sent,
            "Hostmap stats"
        );
    }
}

impl std::fmt::Debug for HostMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMap")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
