use std::time::SystemTime;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::message::Message;

/// Every frame on the command channel is exactly this long.
pub const FRAME_SIZE: usize = 128;

/// Size of the opaque buffer at offset 52.
pub const PAYLOAD_SIZE: usize = 72;

/// Start-of-frame marker (offset 0).
pub const START_MARKER: u32 = 0xF321_E654;

/// End-of-frame marker (offset 124).
pub const END_MARKER: u32 = 0xFEDC_4321;

/// Start marker as it appears on the wire.
pub const START_MARKER_BYTES: [u8; 4] = START_MARKER.to_le_bytes();

/// Flag bit asking the instrument to answer. Required on every query.
pub const CALLBACK_FLAG: u32 = 0x8000_0000;

/// Parameter slots accepted by [`encode_command`].
pub const MAX_PARAMS: usize = 7;

/// Offset of the additional-data byte count.
pub(crate) const ADDITIONAL_SIZE_OFFSET: usize = 48;

/// Default cap on announced additional data: 16 MiB.
pub const DEFAULT_MAX_ADDITIONAL_DATA: usize = 16 * 1024 * 1024;

/// Default number of raw bytes scanned per resync attempt.
pub const DEFAULT_RESYNC_WINDOW: usize = 512;

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest additional-data block a frame may announce. Default: 16 MiB.
    pub max_additional_data: usize,
    /// Raw bytes scanned for a start marker per resync attempt. Default: 512.
    pub resync_window: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_additional_data: DEFAULT_MAX_ADDITIONAL_DATA,
            resync_window: DEFAULT_RESYNC_WINDOW,
        }
    }
}

/// Encode a request frame.
///
/// Wire format (little-endian):
/// ```text
/// ┌────────┬──────┬────────┬──────────────┬──────────────┬───────┬───────┬──────────┬─────────┬────────┐
/// │ 0-3    │ 4-7  │ 8-11   │ 12-23        │ 24-35        │ 36-39 │ 40-47 │ 48-51    │ 52-123  │ 124-127│
/// │ start  │ code │ status │ hw/sub/client│ int32Data0-2 │ flags │ value │ add.size │ buffer  │ end    │
/// └────────┴──────┴────────┴──────────────┴──────────────┴───────┴───────┴──────────┴─────────┴────────┘
/// ```
///
/// `params` map `[0..3]` to `int32Data0-2`, `[3..6]` to the hardware,
/// subsystem and client ids, and `[6]` to the flag bits. Missing params are
/// zero. `data` is zero-padded or truncated to 72 bytes.
pub fn encode_command(code: u32, params: &[i64], value: f64, data: &[u8]) -> Result<Bytes> {
    if params.len() > MAX_PARAMS {
        return Err(FrameError::TooManyParams {
            count: params.len(),
            max: MAX_PARAMS,
        });
    }

    let mut words = [0u32; MAX_PARAMS];
    for (index, (&param, word)) in params.iter().zip(words.iter_mut()).enumerate() {
        *word = param_word(index, param)?;
    }

    let message = Message::new(code)
        .with_int_data([words[0] as i32, words[1] as i32, words[2] as i32])
        .with_ids(words[3], words[4], words[5])
        .with_flags(words[6])
        .with_value(value)
        .with_payload(data);

    let mut dst = BytesMut::with_capacity(FRAME_SIZE);
    encode_message(&message, &mut dst);
    Ok(dst.freeze())
}

/// Encode a full message, appending any additional data after the frame.
pub fn encode_message(message: &Message, dst: &mut BytesMut) {
    let extra = message.additional_data.as_ref().map_or(0, Bytes::len);
    dst.reserve(FRAME_SIZE + extra);

    dst.put_u32_le(START_MARKER);
    dst.put_u32_le(message.command_code);
    dst.put_u32_le(message.status_code);
    dst.put_u32_le(message.hardware_id);
    dst.put_u32_le(message.subsystem_id);
    dst.put_u32_le(message.client_id);
    for value in message.int_data {
        dst.put_i32_le(value);
    }
    dst.put_u32_le(message.flags);
    dst.put_f64_le(message.value);
    dst.put_u32_le(message.additional_data_size);
    dst.put_slice(&message.payload);
    dst.put_u32_le(END_MARKER);

    if let Some(data) = &message.additional_data {
        dst.put_slice(data);
    }
}

/// Decode exactly one frame.
///
/// Only a wrong input length is an error. Marker mismatches are reported
/// through [`Message::valid`] so the caller can attempt a resync.
pub fn decode_frame(src: &[u8]) -> Result<Message> {
    if src.len() != FRAME_SIZE {
        return Err(FrameError::InvalidLength {
            expected: FRAME_SIZE,
            actual: src.len(),
        });
    }

    let mut buf = src;
    let start = buf.get_u32_le();
    let command_code = buf.get_u32_le();
    let status_code = buf.get_u32_le();
    let hardware_id = buf.get_u32_le();
    let subsystem_id = buf.get_u32_le();
    let client_id = buf.get_u32_le();
    let int_data = [buf.get_i32_le(), buf.get_i32_le(), buf.get_i32_le()];
    let flags = buf.get_u32_le();
    let value = buf.get_f64_le();
    let additional_data_size = buf.get_u32_le();
    let mut payload = [0u8; PAYLOAD_SIZE];
    buf.copy_to_slice(&mut payload);
    let end = buf.get_u32_le();

    Ok(Message {
        command_code,
        status_code,
        hardware_id,
        subsystem_id,
        client_id,
        int_data,
        flags,
        value,
        additional_data_size,
        payload,
        received_at: SystemTime::now(),
        additional_data: None,
        valid: start == START_MARKER && end == END_MARKER,
    })
}

/// Offset of the first start marker in `buf`, if any.
pub fn find_start_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(START_MARKER_BYTES.len())
        .position(|window| window == START_MARKER_BYTES)
}

fn param_word(index: usize, param: i64) -> Result<u32> {
    if param < i64::from(i32::MIN) || param > i64::from(u32::MAX) {
        return Err(FrameError::ParamOutOfRange {
            index,
            value: param,
        });
    }
    // Negative params are stored two's-complement.
    Ok(param as u32)
}
