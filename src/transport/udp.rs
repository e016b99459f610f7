//! UDP Underlay
//!
//! A single non-blocking UDP socket shared by every peer. Writes use
//! `try_send_to` so callers on the tick path never await the socket.

use super::{Outside, TransportError};
use crate::endpoint::Endpoint;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::info;

/// UDP implementation of the raw underlay writer.
#[derive(Clone, Debug)]
pub struct UdpOutside {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpOutside {
    /// Bind a socket on `bind_addr` (e.g. `0.0.0.0:4242`).
    pub async fn bind(bind_addr: &str) -> Result<Self, TransportError> {
        let addr: SocketAddr =
            bind_addr
                .parse()
                .map_err(|e: std::net::AddrParseError| TransportError::InvalidBindAddr {
                    addr: bind_addr.to_string(),
                    reason: e.to_string(),
                })?;

        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        let local_addr = socket.local_addr()?;

        info!(local_addr = %local_addr, "UDP underlay bound");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the underlying socket, for the receive path.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

impl Outside for UdpOutside {
    fn write_to(&self, buf: &[u8], addr: &Endpoint) -> io::Result<()> {
        self.socket.try_send_to(buf, addr.to_socket_addr())?;
        Ok(())
    }
}
