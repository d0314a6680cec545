//! Dual TCP transport for microscope controllers.
//!
//! An instrument exposes two raw stream sockets:
//! - a command/response socket on `port`
//! - a live-data socket on `port + 1`
//!
//! This is the lowest layer of scopelink. The [`ConnectionManager`] opens and
//! closes both sockets as a unit; everything else builds on top of it and on
//! the [`InstrumentStream`] type provided here.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::{InstrumentStream, PollRead};
pub use tcp::{live_port_for, parse_ipv4, Channel, ConnectionManager, ConnectionState};
