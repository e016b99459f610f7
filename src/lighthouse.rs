//! Address Discovery
//!
//! The lighthouse service tells us which underlay endpoints reach a given
//! overlay IP. The handshake manager only consumes it through the
//! `Lighthouse` trait; `AddressCache` is the in-memory implementation used
//! by the daemon (seeded from the static host map) and by tests.

use crate::endpoint::Endpoint;
use crate::header::{MessageSubType, MessageType};
use crate::hostmap::HostMap;
use crate::transport::MessageSender;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Known endpoints for one overlay IP, split by address family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    pub v4: Vec<Endpoint>,
    pub v6: Vec<Endpoint>,
}

impl AddressSet {
    /// Build a set from a mixed list of endpoints.
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let mut set = Self::default();
        for ep in endpoints {
            set.insert(ep);
        }
        set
    }

    /// Add an endpoint to the matching family list, ignoring duplicates.
    pub fn insert(&mut self, ep: Endpoint) {
        let list = match ep.ip() {
            IpAddr::V4(_) => &mut self.v4,
            IpAddr::V6(_) => &mut self.v6,
        };
        if !list.contains(&ep) {
            list.push(ep);
        }
    }

    /// All endpoints, IPv4 first.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.v4.iter().chain(self.v6.iter())
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// Address-discovery collaborator.
pub trait Lighthouse: Send + Sync {
    /// Publish a confirmed endpoint for `vpn_ip`, replacing what was known.
    fn add_remote_and_reset(&self, vpn_ip: Ipv4Addr, remote: Endpoint);

    /// Cached candidate endpoints for `vpn_ip` (no network traffic).
    fn query_cache(&self, vpn_ip: Ipv4Addr) -> Vec<Endpoint>;

    /// Raw per-family address entry for `vpn_ip`.
    fn address_map(&self, vpn_ip: Ipv4Addr) -> Option<AddressSet>;

    /// Ask the lighthouses for `vpn_ip`. Answers arrive asynchronously and
    /// land in the cache.
    fn query(&self, vpn_ip: Ipv4Addr, sender: &dyn MessageSender);
}

/// In-memory address cache.
#[derive(Debug, Default)]
pub struct AddressCache {
    /// Overlay IPs of the lighthouses to query.
    lighthouses: Vec<Ipv4Addr>,
    addr_map: RwLock<HashMap<Ipv4Addr, AddressSet>>,
}

impl AddressCache {
    /// Create an empty cache with no lighthouses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache that queries the given lighthouses on a miss.
    pub fn with_lighthouses(lighthouses: Vec<Ipv4Addr>) -> Self {
        Self {
            lighthouses,
            addr_map: RwLock::new(HashMap::new()),
        }
    }

    /// Configured lighthouse overlay IPs.
    pub fn lighthouses(&self) -> &[Ipv4Addr] {
        &self.lighthouses
    }

    /// Replace the entry for `vpn_ip`.
    pub fn set_addresses(&self, vpn_ip: Ipv4Addr, set: AddressSet) {
        self.addr_map.write().insert(vpn_ip, set);
    }

    /// Add one endpoint to the entry for `vpn_ip`.
    pub fn add_remote(&self, vpn_ip: Ipv4Addr, remote: Endpoint) {
        self.addr_map.write().entry(vpn_ip).or_default().insert(remote);
    }

    /// Load statically configured endpoints.
    ///
    /// Each entry is cached here and also added as candidates in `main`, so
    /// lighthouse queries and keepalives can reach those hosts before any
    /// handshake with them has completed.
    pub fn load_static_host_map(
        &self,
        main: &HostMap,
        static_host_map: &BTreeMap<Ipv4Addr, Vec<Endpoint>>,
    ) {
        for (vpn_ip, endpoints) in static_host_map {
            self.set_addresses(*vpn_ip, AddressSet::from_endpoints(endpoints.iter().copied()));
            for remote in endpoints {
                main.add_remote(*vpn_ip, *remote);
            }
            debug!(vpn_ip = %vpn_ip, endpoints = endpoints.len(), "Loaded static host");
        }
    }

    /// Forget everything about `vpn_ip`.
    pub fn remove(&self, vpn_ip: Ipv4Addr) -> Option<AddressSet> {
        self.addr_map.write().remove(&vpn_ip)
    }

    /// Number of overlay IPs with known addresses.
    pub fn len(&self) -> usize {
        self.addr_map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addr_map.read().is_empty()
    }
}

impl Lighthouse for AddressCache {
    fn add_remote_and_reset(&self, vpn_ip: Ipv4Addr, remote: Endpoint) {
        self.addr_map
            .write()
            .insert(vpn_ip, AddressSet::from_endpoints([remote]));
    }

    fn query_cache(&self, vpn_ip: Ipv4Addr) -> Vec<Endpoint> {
        self.addr_map
            .read()
            .get(&vpn_ip)
            .map(|set| set.endpoints().copied().collect())
            .unwrap_or_default()
    }

    fn address_map(&self, vpn_ip: Ipv4Addr) -> Option<AddressSet> {
        self.addr_map.read().get(&vpn_ip).cloned()
    }

    fn query(&self, vpn_ip: Ipv4Addr, sender: &dyn MessageSender) {
        if self.lighthouses.contains(&vpn_ip) {
            // Lighthouses are only reachable through the static host map
            return;
        }
        let query = vpn_ip.octets();
        let mut nb = [0u8; 12];
        let mut out = vec![0u8; crate::transport::MTU];
        for lighthouse in &self.lighthouses {
            debug!(vpn_ip = %vpn_ip, lighthouse = %lighthouse, "Querying lighthouse");
            sender.send_message_to_all(
                MessageType::LightHouse,
                MessageSubType::None,
                *lighthouse,
                &query,
                &mut nb,
                &mut out,
            );
        }
    }
}
