//! Underlay Endpoints
//!
//! An `Endpoint` is a real-network (address, port) pair at which a peer may
//! currently be reachable. It is a plain `Copy` value, so every owner holds
//! its own copy and no two records ever alias the same buffer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing an endpoint string.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint '{input}': {reason}")]
    Invalid { input: String, reason: String },
}

/// A UDP endpoint: IP address and port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from an address and port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Create an IPv4 endpoint.
    pub fn v4(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: IpAddr::V4(ip),
            port,
        }
    }

    /// The IP address.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The UDP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check if the address falls in an RFC1918 private range.
    ///
    /// IPv6 addresses are never considered private here.
    pub fn is_private(&self) -> bool {
        match self.ip {
            IpAddr::V4(v4) => v4.is_private(),
            IpAddr::V6(_) => false,
        }
    }

    /// Convert to a socket address for the transport.
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        // Canonicalize v4-mapped v6 so equality matches the v4 form
        let ip = match addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self {
            ip,
            port: addr.port(),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.to_socket_addr()
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Endpoint::from)
            .map_err(|e| EndpointError::Invalid {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(ep: Endpoint) -> Self {
        ep.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_parse_v4() {
        let ep: Endpoint = "10.1.1.1:4242".parse().unwrap();
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
        assert_eq!(ep.port(), 4242);
        assert_eq!(ep.to_string(), "10.1.1.1:4242");
    }

    #[test]
    fn test_parse_v6() {
        let ep: Endpoint = "[fd00::1]:4242".parse().unwrap();
        assert_eq!(ep.ip(), IpAddr::V6("fd00::1".parse::<Ipv6Addr>().unwrap()));
        assert_eq!(ep.to_string(), "[fd00::1]:4242");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("10.1.1.1".parse::<Endpoint>().is_err());
        assert!("not-an-ip:80".parse::<Endpoint>().is_err());
        assert!("10.1.1.1:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_structural_equality() {
        let a = Endpoint::v4(Ipv4Addr::new(1, 2, 3, 4), 80);
        let b: Endpoint = "1.2.3.4:80".parse().unwrap();
        let c = Endpoint::v4(Ipv4Addr::new(1, 2, 3, 4), 81);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_v4_mapped_canonicalized() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:53".parse().unwrap();
        let ep = Endpoint::from(mapped);
        assert_eq!(ep, Endpoint::v4(Ipv4Addr::new(10, 0, 0, 1), 53));
    }

    #[test]
    fn test_is_private() {
        for s in ["10.0.0.1:1", "172.16.5.5:1", "172.31.255.255:1", "192.168.1.1:1"] {
            assert!(s.parse::<Endpoint>().unwrap().is_private(), "{s}");
        }
        for s in ["8.8.8.8:1", "172.32.0.1:1", "[fd00::1]:1"] {
            assert!(!s.parse::<Endpoint>().unwrap().is_private(), "{s}");
        }
    }

    #[test]
    fn test_serde_as_string() {
        let ep: Endpoint = serde_yaml::from_str("\"1.2.3.4:80\"").unwrap();
        assert_eq!(ep, Endpoint::v4(Ipv4Addr::new(1, 2, 3, 4), 80));
        assert!(serde_yaml::to_string(&ep).unwrap().contains("1.2.3.4:80"));
        assert!(serde_yaml::from_str::<Endpoint>("\"1.2.3.4\"").is_err());
    }
}
