use std::time::Duration;

/// Errors that can occur in client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] scopelink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] scopelink_frame::FrameError),

    /// No instrument connection is open.
    #[error("not connected")]
    NotConnected,

    /// The background reader is not running, so no reply can arrive.
    #[error("background reader is not running")]
    ReaderStopped,

    /// The background reader thread could not be spawned.
    #[error("failed to spawn background reader: {0}")]
    ReaderSpawn(std::io::Error),

    /// A synchronous exchange received a frame with bad markers.
    #[error("invalid frame received (code {code:#x})")]
    InvalidFrame { code: u32 },

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// True for any flavour of deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_)
                | ClientError::Transport(scopelink_transport::TransportError::Timeout(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
