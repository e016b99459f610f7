//! Connection State
//!
//! Opaque handle to the cryptographic session negotiated for a peer. The
//! record layer owns the keys and ciphers; this core only needs the peer's
//! certificate, the readiness flag and the outbound message counter.

use crate::cert::Certificate;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Session state for one tunnel, owned by exactly one `HostInfo`.
pub struct ConnectionState {
    /// Whether we sent the first handshake message.
    initiator: bool,
    /// Certificate presented by the peer, once verified.
    peer_cert: Option<Arc<Certificate>>,
    /// Set once the handshake completes and stored packets are flushed.
    ready: AtomicBool,
    /// Outbound message counter for the record layer.
    message_counter: AtomicU64,
}

impl ConnectionState {
    /// Create state for a new handshake.
    pub fn new(initiator: bool) -> Self {
        Self {
            initiator,
            peer_cert: None,
            ready: AtomicBool::new(false),
            message_counter: AtomicU64::new(0),
        }
    }

    /// Attach the verified peer certificate.
    pub fn with_peer_cert(mut self, cert: Certificate) -> Self {
        self.peer_cert = Some(Arc::new(cert));
        self
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// The peer's certificate, if the handshake got far enough to verify it.
    pub fn peer_cert(&self) -> Option<Arc<Certificate>> {
        self.peer_cert.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Current value of the outbound message counter.
    pub fn message_counter(&self) -> u64 {
        self.message_counter.load(Ordering::Acquire)
    }

    pub fn set_message_counter(&self, value: u64) {
        self.message_counter.store(value, Ordering::Release);
    }

    /// Reserve the next outbound message counter.
    pub fn next_message_counter(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("initiator", &self.initiator)
            .field("ready", &self.is_ready())
            .field("message_counter", &self.message_counter())
            .field("peer_names", &self.peer_cert.as_ref().map(|c| &c.names))
            .finish()
    }
}
