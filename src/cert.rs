//! Peer Certificates
//!
//! Read-only view of a peer's certificate details. Parsing, signature
//! verification and the wire encoding belong to the certificate layer;
//! this core only reads the overlay addresses, subnets and names.

use crate::cidr::Cidr;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Certificate details for a mesh peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Display names; each one is registered with the name service.
    pub names: Vec<String>,
    /// Overlay addresses with their network masks.
    pub ips: Vec<Cidr>,
    /// Additional subnets routed through this peer.
    pub subnets: Vec<Cidr>,
    /// Group memberships.
    pub groups: Vec<String>,
    /// Validity window start (Unix seconds).
    pub not_before: i64,
    /// Validity window end (Unix seconds).
    pub not_after: i64,
    /// Public key bytes.
    pub public_key: Vec<u8>,
    /// Whether this is a CA certificate.
    pub is_ca: bool,
    /// SHA-256 of the issuer certificate; empty if self-signed.
    pub issuer: Vec<u8>,
}

impl Certificate {
    /// The peer's primary overlay address (first IPv4 entry).
    pub fn vpn_ip(&self) -> Option<Ipv4Addr> {
        self.ips.iter().find_map(|c| match c.addr() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    }

    /// Whether the certificate is valid at `unix_secs`.
    pub fn is_valid_at(&self, unix_secs: i64) -> bool {
        unix_secs >= self.not_before && unix_secs <= self.not_after
    }

    /// Whether the peer needs a per-host subnet tree (more than one
    /// overlay address or any routed subnet).
    pub fn has_multiple_networks(&self) -> bool {
        self.ips.len() != 1 || !self.subnets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_cidr(s: &str) -> Cidr {
        Cidr::host(s.parse().unwrap())
    }

    #[test]
    fn test_vpn_ip_first_v4() {
        let cert = Certificate {
            ips: vec![host_cidr("fd00::1"), host_cidr("172.1.1.2")],
            ..Default::default()
        };
        assert_eq!(cert.vpn_ip(), Some(Ipv4Addr::new(172, 1, 1, 2)));
        assert_eq!(Certificate::default().vpn_ip(), None);
    }

    #[test]
    fn test_validity_window() {
        let cert = Certificate {
            not_before: 100,
            not_after: 200,
            ..Default::default()
        };
        assert!(!cert.is_valid_at(99));
        assert!(cert.is_valid_at(100));
        assert!(cert.is_valid_at(200));
        assert!(!cert.is_valid_at(201));
    }

    #[test]
    fn test_multiple_networks() {
        let simple = Certificate {
            ips: vec![host_cidr("172.1.1.2")],
            ..Default::default()
        };
        assert!(!simple.has_multiple_networks());

        let routed = Certificate {
            ips: vec![host_cidr("172.1.1.2")],
            subnets: vec!["10.9.0.0/16".parse().unwrap()],
            ..Default::default()
        };
        assert!(routed.has_multiple_networks());
    }
}
