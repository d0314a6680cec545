//! Fixed-size binary framing for microscope controllers.
//!
//! Every message on the command channel is exactly 128 bytes:
//! - A 4-byte start marker (`0xF321E654`) for stream synchronization
//! - Command code, status, three device ids, three data words, flags, a float
//! - A 72-byte opaque buffer
//! - A 4-byte end marker (`0xFEDC4321`)
//!
//! A frame may announce additional raw bytes that follow it on the wire.
//! The reader consumes them before anything else so the next frame stays
//! aligned, and can relocate frame boundaries after corruption.

pub mod codec;
pub mod codes;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_command, encode_message, find_start_marker, FrameConfig, CALLBACK_FLAG,
    DEFAULT_MAX_ADDITIONAL_DATA, DEFAULT_RESYNC_WINDOW, END_MARKER, FRAME_SIZE, MAX_PARAMS,
    PAYLOAD_SIZE, START_MARKER, START_MARKER_BYTES,
};
pub use codes::{code_name, is_unsolicited, UNSOLICITED_CODES};
pub use error::{FrameError, Result};
pub use message::Message;
pub use reader::{FrameReader, ReadEvent, ResyncOutcome};
pub use writer::FrameWriter;
