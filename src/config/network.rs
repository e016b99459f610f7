//! Underlay, lighthouse and name-service configuration.

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default UDP bind address for the underlay socket.
const DEFAULT_LISTEN_BIND_ADDR: &str = "0.0.0.0:4242";

/// Default keepalive punch interval.
const DEFAULT_PUNCHY_INTERVAL_SECS: u64 = 30;

/// Default DNS responder bind address.
const DEFAULT_DNS_BIND_ADDR: &str = "127.0.0.1:53";

/// Default TTL for DNS answers.
const DEFAULT_DNS_TTL: u32 = 300;

/// Underlay socket (`listen.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// Bind address (`listen.bind_addr`). Defaults to "0.0.0.0:4242".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
}

impl ListenConfig {
    /// Get the bind address, using default if not configured.
    pub fn bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or(DEFAULT_LISTEN_BIND_ADDR)
    }
}

/// NAT keepalive punching (`punchy.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PunchyConfig {
    /// Send keepalives to every known endpoint (`punchy.enabled`).
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between rounds (`punchy.interval_secs`). Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

impl PunchyConfig {
    /// Get the punch interval, using default if not configured.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(DEFAULT_PUNCHY_INTERVAL_SECS))
    }
}

/// Address discovery (`lighthouse.*`).
///
/// ```yaml
/// lighthouse:
///   hosts:
///     - 172.1.1.1
///   static_host_map:
///     172.1.1.1:
///       - 203.0.113.7:4242
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LighthouseConfig {
    /// Overlay IPs of the lighthouses to query (`lighthouse.hosts`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Ipv4Addr>,

    /// Known underlay endpoints per overlay IP (`lighthouse.static_host_map`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub static_host_map: BTreeMap<Ipv4Addr, Vec<Endpoint>>,
}

/// Peer name responder (`dns.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Register peer names and serve them (`dns.enabled`).
    #[serde(default)]
    pub enabled: bool,

    /// Responder bind address (`dns.bind_addr`). Defaults to "127.0.0.1:53".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// Answer TTL in seconds (`dns.ttl`). Defaults to 300.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

impl DnsConfig {
    /// Get the bind address, using default if not configured.
    pub fn bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or(DEFAULT_DNS_BIND_ADDR)
    }

    /// Get the answer TTL, using default if not configured.
    pub fn ttl(&self) -> u32 {
        self.ttl.unwrap_or(DEFAULT_DNS_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(ListenConfig::default().bind_addr(), "0.0.0.0:4242");
        assert_eq!(PunchyConfig::default().interval(), Duration::from_secs(30));
        assert!(!PunchyConfig::default().enabled);
        assert_eq!(DnsConfig::default().bind_addr(), "127.0.0.1:53");
        assert_eq!(DnsConfig::default().ttl(), 300);
    }

    #[test]
    fn test_parse_lighthouse() {
        let yaml = r#"
hosts:
  - 172.1.1.1
static_host_map:
  172.1.1.1:
    - "203.0.113.7:4242"
    - "[2001:db8::7]:4242"
"#;
        let config: LighthouseConfig = serde_yaml::from_str(yaml).unwrap();
        let lh = Ipv4Addr::new(172, 1, 1, 1);
        assert_eq!(config.hosts, vec![lh]);
        let endpoints = &config.static_host_map[&lh];
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0], "203.0.113.7:4242".parse().unwrap());
    }

    #[test]
    fn test_parse_bad_endpoint() {
        let yaml = r#"
static_host_map:
  172.1.1.1:
    - "203.0.113.7"
"#;
        assert!(serde_yaml::from_str::<LighthouseConfig>(yaml).is_err());
    }
}
