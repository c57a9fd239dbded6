//! Transport Error Types
//!
//! Error handling for socket transport, channel lifecycle and handshake
//! failures. Transient conditions (would-block, pending flush) are not errors
//! and never appear here; they are modeled as events and write outcomes.

use std::net::SocketAddr;
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Wire protocol and handshake errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Channel state machine violations
    #[error("Channel state error: {message} (state: {state})")]
    ChannelState { message: String, state: String },

    /// Transport timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Resource exhaustion errors
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Peer went silent past the negotiated ping timeout
    #[error("Ping timeout: no data or ping received for {timeout_secs}s")]
    PingTimeout { timeout_secs: u64 },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a channel state error
    pub fn channel_state(message: impl Into<String>, state: impl Into<String>) -> Self {
        Self::ChannelState {
            message: message.into(),
            state: state.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a ping timeout error
    pub fn ping_timeout(timeout_secs: u64) -> Self {
        Self::PingTimeout { timeout_secs }
    }

    /// Check if this error is fatal to the channel it occurred on
    ///
    /// Everything except configuration rejection and buffer exhaustion closes
    /// the channel; resource exhaustion is retried after a flush.
    pub fn is_channel_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::Configuration { .. } | TransportError::ResourceExhausted { .. }
        )
    }

    /// Check if this is a retryable error (reconnect may succeed)
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { .. } => true,
            TransportError::Connection { .. } => true,
            TransportError::Timeout { .. } => true,
            TransportError::ResourceExhausted { .. } => true,
            TransportError::PingTimeout { .. } => true,
            TransportError::Io { .. } => true,
            TransportError::Protocol { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::ChannelState { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::ChannelState { .. } => "channel_state",
            TransportError::Timeout { .. } => "timeout",
            TransportError::ResourceExhausted { .. } => "resource_exhausted",
            TransportError::PingTimeout { .. } => "ping_timeout",
            TransportError::Io { .. } => "io",
        }
    }
}

/// Convert standard I/O errors to transport errors
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_error_construction() {
        let err = TransportError::network("Connection refused");
        assert_eq!(err.category(), "network");
        assert!(err.is_retryable());
        assert!(err.is_channel_fatal());
    }

    #[test]
    fn test_connection_error_carries_addr() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 4, 1, 13)), 14002);
        let err = TransportError::connection("Handshake rejected", Some(addr));

        match err {
            TransportError::Connection { remote_addr, .. } => {
                assert_eq!(remote_addr, Some(addr));
            }
            _ => panic!("Expected Connection error"),
        }
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!TransportError::configuration("bad cron", Some("detection_schedule"))
            .is_channel_fatal());
        assert!(!TransportError::resource_exhausted("buffer_pool", "no free buffers")
            .is_channel_fatal());
        assert!(TransportError::ping_timeout(30).is_channel_fatal());
        assert!(TransportError::protocol("bad frame header").is_channel_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::timeout("connect", 5000).is_retryable());
        assert!(TransportError::ping_timeout(30).is_retryable());
        assert!(!TransportError::protocol("version mismatch").is_retryable());
        assert!(!TransportError::configuration("unknown endpoint", None).is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = TransportError::from(io_err);
        assert_eq!(err.category(), "io");
        assert!(err.is_channel_fatal());
    }
}
