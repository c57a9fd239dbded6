//! Socket Transport
//!
//! Connection-level plumbing for the market-data session layer: endpoint
//! sets, the channel state machine with its wire framing and handshake,
//! per-channel buffer pools, and the keep-alive ping monitor. Everything
//! here is non-blocking; the session layer above owns the dispatch loop
//! that parks on readiness.

pub mod buffer;
pub mod channel;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod ping;
pub mod server;
pub mod socket;

// Re-export commonly used types
pub use buffer::BufferPool;
pub use channel::{
    Channel, ChannelRole, ChannelState, ConnectOptions, InitProgress, Negotiated, Priority,
    ReadEvent, WriteOutcome,
};
pub use endpoint::{Endpoint, EndpointSet};
pub use error::{Result, TransportError};
pub use handshake::HandshakeLimits;
pub use ping::{PingMonitor, PingVerdict};
pub use server::Listener;
pub use socket::Socket;
