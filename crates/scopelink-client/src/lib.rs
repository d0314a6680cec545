//! Command client engine for microscope controllers.
//!
//! A single background thread drains the command channel and routes each
//! frame to a waiting caller, to registered callbacks, or to a bounded queue
//! of unsolicited notifications. Callers send requests from any thread and
//! block only on their own reply.

pub mod background;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod stats;

pub use background::{BackgroundReader, ReaderState};
pub use client::{CommandClient, Reply};
pub use config::{ClientConfig, DispatcherConfig, ReaderConfig};
pub use dispatcher::{CallbackId, Dispatcher, DropReason, Handler, PendingRequest, Route};
pub use error::{ClientError, Result};
pub use stats::{DispatcherStats, EngineStats, ReaderStats};
