//! Meshpeer Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./meshpeer.yaml` (current directory - highest priority)
//! 2. `~/.config/meshpeer/meshpeer.yaml` (user config directory)
//! 3. `/etc/meshpeer/meshpeer.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! vpn_cidr: 172.1.1.0/24
//! preferred_ranges:
//!   - 10.1.1.0/24
//! handshakes:
//!   try_interval_ms: 2000
//!   retries: 4
//! listen:
//!   bind_addr: "0.0.0.0:4242"
//! lighthouse:
//!   hosts: [172.1.1.1]
//!   static_host_map:
//!     172.1.1.1: ["203.0.113.7:4242"]
//! ```

mod handshake;
mod network;

use crate::cidr::Cidr;
use crate::hostmap::UnsafeRoute;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use handshake::HandshakesConfig;
pub use network::{DnsConfig, LighthouseConfig, ListenConfig, PunchyConfig};

/// Default config filename.
const CONFIG_FILENAME: &str = "meshpeer.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Overlay network of this node (`vpn_cidr`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_cidr: Option<Cidr>,

    /// Single local range, kept for older configs (`local_range`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_range: Option<Cidr>,

    /// Underlay ranges preferred when picking a peer endpoint
    /// (`preferred_ranges`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_ranges: Vec<Cidr>,

    /// Static routes to networks behind peers (`unsafe_routes`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsafe_routes: Vec<UnsafeRoute>,

    /// Handshake retry policy (`handshakes.*`).
    #[serde(default)]
    pub handshakes: HandshakesConfig,

    /// Underlay socket (`listen.*`).
    #[serde(default)]
    pub listen: ListenConfig,

    /// Keepalive punching (`punchy.*`).
    #[serde(default)]
    pub punchy: PunchyConfig,

    /// Address discovery (`lighthouse.*`).
    #[serde(default)]
    pub lighthouse: LighthouseConfig,

    /// Peer name responder (`dns.*`).
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Returns a tuple of (config, paths_loaded) where paths_loaded contains
    /// the paths that were successfully loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    /// Missing files are skipped.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/meshpeer").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("meshpeer").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present. Lists
    /// are replaced when non-empty; static host entries are merged per IP.
    pub fn merge(&mut self, other: Config) {
        if other.vpn_cidr.is_some() {
            self.vpn_cidr = other.vpn_cidr;
        }
        if other.local_range.is_some() {
            self.local_range = other.local_range;
        }
        if !other.preferred_ranges.is_empty() {
            self.preferred_ranges = other.preferred_ranges;
        }
        if !other.unsafe_routes.is_empty() {
            self.unsafe_routes = other.unsafe_routes;
        }
        self.handshakes.merge(other.handshakes);
        // Merge listen section
        if other.listen.bind_addr.is_some() {
            self.listen.bind_addr = other.listen.bind_addr;
        }
        // Merge punchy section
        if other.punchy.enabled {
            self.punchy.enabled = true;
        }
        if other.punchy.interval_secs.is_some() {
            self.punchy.interval_secs = other.punchy.interval_secs;
        }
        // Merge lighthouse section
        if !other.lighthouse.hosts.is_empty() {
            self.lighthouse.hosts = other.lighthouse.hosts;
        }
        self.lighthouse
            .static_host_map
            .extend(other.lighthouse.static_host_map);
        // Merge dns section
        if other.dns.enabled {
            self.dns.enabled = true;
        }
        if other.dns.bind_addr.is_some() {
            self.dns.bind_addr = other.dns.bind_addr;
        }
        if other.dns.ttl.is_some() {
            self.dns.ttl = other.dns.ttl;
        }
    }

    /// Preferred ranges including the legacy `local_range`, without
    /// duplicates.
    pub fn preferred_ranges(&self) -> Vec<Cidr> {
        let mut ranges = self.preferred_ranges.clone();
        if let Some(local) = self.local_range
            && !ranges.contains(&local)
        {
            ranges.push(local);
        }
        ranges
    }

    /// Check cross-field constraints that parsing alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshakes.try_interval().is_zero() {
            return Err(ConfigError::Invalid(
                "handshakes.try_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.handshakes.trigger_buffer() == 0 {
            return Err(ConfigError::Invalid(
                "handshakes.trigger_buffer must be greater than zero".to_string(),
            ));
        }
        if self.punchy.enabled && self.punchy.interval().is_zero() {
            return Err(ConfigError::Invalid(
                "punchy.interval_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(network) = self.vpn_cidr {
            for host in &self.lighthouse.hosts {
                if !network.contains(&IpAddr::V4(*host)) {
                    return Err(ConfigError::Invalid(format!(
                        "lighthouse host {} is not in vpn network {}",
                        host, network
                    )));
                }
            }
            for route in &self.unsafe_routes {
                if !network.contains(&IpAddr::V4(route.via)) {
                    return Err(ConfigError::Invalid(format!(
                        "unsafe route {} via {} is not in vpn network {}",
                        route.route, route.via, network
                    )));
                }
            }
        }

        Ok(())
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
