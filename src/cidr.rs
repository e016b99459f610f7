//! CIDR Prefixes and Longest-Prefix Match
//!
//! `Cidr` is an address/prefix-length pair used for preferred ranges, the
//! VPN network, certificate subnets and unsafe routes. `CidrTree` is a
//! binary trie answering "most specific prefix containing this address".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing or building CIDR prefixes.
#[derive(Debug, Error)]
pub enum CidrError {
    #[error("invalid CIDR '{0}': expected <addr>/<prefix>")]
    Malformed(String),

    #[error("invalid address in CIDR '{0}'")]
    InvalidAddress(String),

    #[error("prefix length {prefix} exceeds {max} for {input}")]
    PrefixTooLong { input: String, prefix: u8, max: u8 },
}

/// An IPv4 or IPv6 network prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Create a prefix, masking off host bits.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CidrError> {
        let max = max_prefix(&addr);
        if prefix > max {
            return Err(CidrError::PrefixTooLong {
                input: format!("{}/{}", addr, prefix),
                prefix,
                max,
            });
        }
        let addr = match addr {
            IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & mask32(prefix)).into()),
            IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & mask128(prefix)).into()),
        };
        Ok(Self { addr, prefix })
    }

    /// A host route (/32 or /128) for a single address.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            prefix: max_prefix(&addr),
            addr,
        }
    }

    /// Network address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Check if an address falls inside this prefix.
    ///
    /// Addresses of the other family never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(*ip) & mask32(self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(*ip) & mask128(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask32(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn mask128(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| CidrError::Malformed(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| CidrError::InvalidAddress(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CidrError::Malformed(s.to_string()))?;
        Cidr::new(addr, prefix)
    }
}

impl TryFrom<String> for Cidr {
    type Error = CidrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Cidr> for String {
    fn from(c: Cidr) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Debug)]
struct TrieNode<T> {
    children: [Option<usize>; 2],
    value: Option<T>,
}

impl<T> TrieNode<T> {
    fn empty() -> Self {
        Self {
            children: [None, None],
            value: None,
        }
    }
}

/// Longest-prefix-match table keyed by CIDR prefixes.
///
/// Nodes live in a flat arena; IPv4 and IPv6 have separate roots.
#[derive(Debug)]
pub struct CidrTree<T> {
    nodes: Vec<TrieNode<T>>,
    len: usize,
}

const ROOT_V4: usize = 0;
const ROOT_V6: usize = 1;

impl<T> CidrTree<T> {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::empty(), TrieNode::empty()],
            len: 0,
        }
    }

    /// Number of prefixes stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the tree has no prefixes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a prefix, replacing any value already stored for it.
    pub fn add(&mut self, cidr: Cidr, value: T) {
        let (mut node, bits, width) = root_and_bits(&cidr.addr());
        for depth in 0..cidr.prefix() {
            let bit = bit_at(bits, width, depth);
            node = match self.nodes[node].children[bit] {
                Some(next) => next,
                None => {
                    self.nodes.push(TrieNode::empty());
                    let next = self.nodes.len() - 1;
                    self.nodes[node].children[bit] = Some(next);
                    next
                }
            };
        }
        if self.nodes[node].value.replace(value).is_none() {
            self.len += 1;
        }
    }

    /// Value of the most specific prefix containing `ip`, if any.
    pub fn most_specific_contains(&self, ip: &IpAddr) -> Option<&T> {
        let (mut node, bits, width) = root_and_bits(ip);
        let mut best = self.nodes[node].value.as_ref();
        for depth in 0..width {
            match self.nodes[node].children[bit_at(bits, width, depth)] {
                Some(next) => {
                    node = next;
                    if let Some(v) = self.nodes[node].value.as_ref() {
                        best = Some(v);
                    }
                }
                None => break,
            }
        }
        best
    }

    /// Check if any prefix contains `ip`.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.most_specific_contains(ip).is_some()
    }
}

impl<T> Default for CidrTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn root_and_bits(ip: &IpAddr) -> (usize, u128, u8) {
    match ip {
        IpAddr::V4(v4) => (ROOT_V4, u128::from(u32::from(*v4)), 32),
        IpAddr::V6(v6) => (ROOT_V6, u128::from(*v6), 128),
    }
}

fn bit_at(bits: u128, width: u8, depth: u8) -> usize {
    ((bits >> (width - 1 - depth)) & 1) as usize
}
