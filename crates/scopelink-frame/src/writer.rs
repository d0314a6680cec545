use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_command, encode_message, FrameConfig, FRAME_SIZE};
use crate::error::{FrameError, Result};
use crate::message::Message;

/// Writes complete frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(FRAME_SIZE),
            config,
        }
    }

    /// Write a message and any additional data attached to it.
    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        let extra = message.additional_data.as_ref().map_or(0, |data| data.len());
        if extra > self.config.max_additional_data {
            return Err(FrameError::AdditionalDataTooLarge {
                size: extra,
                max: self.config.max_additional_data,
            });
        }

        self.buf.clear();
        encode_message(message, &mut self.buf);
        let bytes = self.buf.split().freeze();
        self.write_raw(&bytes)
    }

    /// Encode and send a request frame.
    pub fn send_command(&mut self, code: u32, params: &[i64], value: f64, data: &[u8]) -> Result<()> {
        let frame = encode_command(code, params, value, data)?;
        self.write_raw(&frame)
    }

    /// Write pre-encoded bytes as-is.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < bytes.len() {
            match self.inner.write(&bytes[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
