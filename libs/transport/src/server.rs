//! Provider-Side Listener
//!
//! Accepts inbound connections and wraps each one as a server-role
//! [`Channel`](crate::Channel) in `Initializing`; the owner drives the
//! handshake with `continue_init` exactly as a client does. Accepted
//! channels are provider-style: preferred-host failover never applies to
//! them.

use crate::channel::{Channel, ConnectOptions};
use crate::endpoint::Endpoint;
use crate::handshake::HandshakeLimits;
use crate::{Result, TransportError};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Accepting socket plus the negotiation limits applied to every connection
pub struct Listener {
    listener: TcpListener,
    opts: ConnectOptions,
    limits: HandshakeLimits,
}

impl Listener {
    /// Bind to `addr` (e.g. `"127.0.0.1:14002"`)
    pub async fn bind(addr: &str, opts: ConnectOptions, limits: HandshakeLimits) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TransportError::network_with_source(format!("Failed to bind {}", addr), e)
        })?;
        info!(%addr, "Listening");
        Ok(Self {
            listener,
            opts,
            limits,
        })
    }

    /// The bound local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::network_with_source("No local address", e))
    }

    /// Accept one connection as a server-role channel in `Initializing`
    pub async fn accept(&self) -> Result<Channel> {
        let (stream, peer) = self.listener.accept().await.map_err(|e| {
            TransportError::network_with_source("Failed to accept connection", e)
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        info!(%peer, "Accepted connection");
        let endpoint = Endpoint::new(format!("accept_{}", peer), peer.ip().to_string(), peer.port());
        Ok(Channel::accepted(
            stream.into(),
            endpoint,
            &self.opts,
            self.limits,
        ))
    }
}
