use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in instrument transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The address is not a dotted-quad IPv4 address.
    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    /// The command port is out of range (the live port must also fit).
    #[error("invalid command port {0} (expected 1-65534)")]
    InvalidPort(u32),

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// An operation required an open connection.
    #[error("not connected")]
    NotConnected,

    /// A receive did not complete before its deadline.
    #[error("receive timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
