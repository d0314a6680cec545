use std::time::SystemTime;

use bytes::Bytes;

use crate::codec::{CALLBACK_FLAG, FRAME_SIZE, PAYLOAD_SIZE};

/// A decoded instrument frame.
///
/// `valid` is false when either marker did not match; the remaining fields
/// then hold whatever bytes sat at their offsets.
#[derive(Debug, Clone)]
pub struct Message {
    pub command_code: u32,
    pub status_code: u32,
    pub hardware_id: u32,
    pub subsystem_id: u32,
    pub client_id: u32,
    /// `int32Data0-2`, commonly axis / index / value.
    pub int_data: [i32; 3],
    pub flags: u32,
    pub value: f64,
    /// Number of raw bytes that follow this frame on the wire.
    pub additional_data_size: u32,
    pub payload: [u8; PAYLOAD_SIZE],
    /// When the frame was decoded.
    pub received_at: SystemTime,
    pub additional_data: Option<Bytes>,
    pub valid: bool,
}

impl Message {
    /// A valid, zeroed message for `command_code`.
    pub fn new(command_code: u32) -> Self {
        Self {
            command_code,
            status_code: 0,
            hardware_id: 0,
            subsystem_id: 0,
            client_id: 0,
            int_data: [0; 3],
            flags: 0,
            value: 0.0,
            additional_data_size: 0,
            payload: [0; PAYLOAD_SIZE],
            received_at: SystemTime::now(),
            additional_data: None,
            valid: true,
        }
    }

    pub fn with_status(mut self, status_code: u32) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_ids(mut self, hardware_id: u32, subsystem_id: u32, client_id: u32) -> Self {
        self.hardware_id = hardware_id;
        self.subsystem_id = subsystem_id;
        self.client_id = client_id;
        self
    }

    pub fn with_int_data(mut self, int_data: [i32; 3]) -> Self {
        self.int_data = int_data;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Copy `data` into the opaque buffer, zero-padded or truncated.
    pub fn with_payload(mut self, data: &[u8]) -> Self {
        self.payload = [0; PAYLOAD_SIZE];
        let len = data.len().min(PAYLOAD_SIZE);
        self.payload[..len].copy_from_slice(&data[..len]);
        self
    }

    /// Attach trailing bytes and announce their size in the frame.
    pub fn with_additional_data(mut self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        self.additional_data_size = data.len() as u32;
        self.additional_data = Some(data);
        self
    }

    /// The opaque buffer as text, up to the first NUL.
    pub fn payload_str(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PAYLOAD_SIZE);
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// Parse `axis=value` lines from the opaque buffer.
    ///
    /// Lines without `=` or with a non-numeric value are skipped.
    pub fn axis_values(&self) -> Vec<(String, f64)> {
        self.payload_str()
            .lines()
            .filter_map(|line| {
                let (axis, value) = line.split_once('=')?;
                let axis = axis.trim();
                if axis.is_empty() {
                    return None;
                }
                let value = value.trim().parse::<f64>().ok()?;
                Some((axis.to_string(), value))
            })
            .collect()
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn int_triple(&self) -> (i32, i32, i32) {
        (self.int_data[0], self.int_data[1], self.int_data[2])
    }

    /// Whether the trigger-callback bit is set.
    pub fn has_callback_flag(&self) -> bool {
        self.flags & CALLBACK_FLAG != 0
    }

    /// Status zero means the instrument accepted the command.
    pub fn is_ok(&self) -> bool {
        self.status_code == 0
    }

    /// Bytes this message occupies on the wire, trailing data included.
    pub fn wire_size(&self) -> usize {
        FRAME_SIZE + self.additional_data_size as usize
    }
}
