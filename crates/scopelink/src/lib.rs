//! Client engine for microscope controllers reachable over TCP.
//!
//! The controller exposes a command channel on `port` and a live-data
//! channel on `port + 1`. Requests and replies are fixed 128-byte frames;
//! the controller also pushes notifications at any time.
//!
//! # Crate Structure
//!
//! - [`transport`]: the two TCP connections and their lifecycle
//! - [`frame`]: the 128-byte frame codec, command codes, stream reader/writer
//! - [`client`]: background reader, dispatcher and the [`CommandClient`] façade

/// Re-export transport types.
pub mod transport {
    pub use scopelink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use scopelink_frame::*;
}

/// Re-export client types.
pub mod client {
    pub use scopelink_client::*;
}

pub use scopelink_client::{ClientConfig, ClientError, CommandClient, Reply};
pub use scopelink_frame::Message;
