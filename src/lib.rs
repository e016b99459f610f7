//! meshpeer: peer registry and handshake orchestration
//!
//! The peer-state core of an encrypted mesh overlay network. It tracks
//! which peers exist, which underlay endpoints reach them, and drives
//! pending handshakes through retry, expiry and promotion.

pub mod cert;
pub mod cidr;
pub mod config;
pub mod dns;
pub mod endpoint;
pub mod handshake;
pub mod header;
pub mod hostmap;
pub mod lighthouse;
pub mod transport;
pub mod wheel;

// Re-export value types
pub use cert::Certificate;
pub use cidr::{Cidr, CidrError, CidrTree};
pub use endpoint::{Endpoint, EndpointError};
pub use header::{MessageSubType, MessageType};

// Re-export config types
pub use config::{
    Config, ConfigError, DnsConfig, HandshakesConfig, LighthouseConfig, ListenConfig, PunchyConfig,
};

// Re-export registry types
pub use hostmap::{
    ConnectionState, HostInfo, HostInfoSnapshot, HostMap, HostMapError, HostMapStats, RoamOutcome,
    SlotId, UnsafeRoute,
};

// Re-export handshake types
pub use handshake::{HandshakeError, HandshakeManager, HandshakeTasks};

// Re-export collaborator types
pub use dns::{DnsRecords, NameRegistry};
pub use lighthouse::{AddressCache, AddressSet, Lighthouse};
pub use transport::udp::UdpOutside;
pub use transport::{MessageSender, Outside, OutsideSender, TransportError};

pub use wheel::TimerWheel;
