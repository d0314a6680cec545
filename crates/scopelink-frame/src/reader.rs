use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::codec::{
    decode_frame, find_start_marker, FrameConfig, ADDITIONAL_SIZE_OFFSET, FRAME_SIZE,
    START_MARKER_BYTES,
};
use crate::error::{FrameError, Result};
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// What one successful pass of the reader produced.
#[derive(Debug)]
pub enum ReadEvent {
    /// A frame with both markers intact, additional data attached.
    Frame(Message),
    /// 128 bytes whose markers did not match. Already consumed.
    Invalid(Message),
}

/// Result of one resynchronization attempt.
#[derive(Debug)]
pub enum ResyncOutcome {
    /// A valid frame was found after skipping `discarded` bytes.
    Recovered { message: Message, discarded: usize },
    /// No start marker in the scanned window.
    NotFound { discarded: usize },
    /// A start marker was found but the candidate frame was invalid.
    Rejected { discarded: usize },
    /// Aligned on a start marker; the rest of the frame has not arrived yet.
    Incomplete { discarded: usize },
}

enum Fill {
    Data,
    TimedOut,
}

/// Reads fixed-size frames from any `Read` stream.
///
/// Reads never go past the frame (and its additional data) currently being
/// assembled, so a caller that stops polling between frames leaves the
/// stream positioned on a frame boundary. Bytes of a partially received
/// frame are kept across read timeouts.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    bytes_read: u64,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            bytes_read: 0,
        }
    }

    /// Try to assemble the next frame.
    ///
    /// Returns `Ok(None)` when the underlying read timed out before a whole
    /// frame (plus its announced additional data) arrived, and
    /// `Err(FrameError::ConnectionClosed)` at EOF.
    pub fn poll_frame(&mut self) -> Result<Option<ReadEvent>> {
        loop {
            if let Some(event) = self.next_buffered()? {
                return Ok(Some(event));
            }
            if let Fill::TimedOut = self.fill(self.bytes_needed())? {
                return Ok(None);
            }
        }
    }

    /// Read the next frame, treating a read timeout as an error.
    pub fn read_frame(&mut self) -> Result<ReadEvent> {
        match self.poll_frame()? {
            Some(event) => Ok(event),
            None => Err(FrameError::Io(std::io::Error::from(ErrorKind::TimedOut))),
        }
    }

    /// Relocate the next frame boundary after stream corruption.
    ///
    /// Buffers up to `resync_window` raw bytes, searches them for the start
    /// marker and decodes the 128 bytes starting there.
    pub fn resync(&mut self) -> Result<ResyncOutcome> {
        let window = self.config.resync_window.max(FRAME_SIZE);
        while self.buf.len() < window {
            match self.fill(window - self.buf.len()) {
                Ok(Fill::Data) => {}
                Ok(Fill::TimedOut) => break,
                Err(FrameError::ConnectionClosed) if !self.buf.is_empty() => break,
                Err(err) => return Err(err),
            }
        }

        let scan_len = self.buf.len().min(window);
        let Some(offset) = find_start_marker(&self.buf[..scan_len]) else {
            // Keep a tail in case the marker straddles the window edge.
            let discarded = scan_len.saturating_sub(START_MARKER_BYTES.len() - 1);
            self.buf.advance(discarded);
            if discarded > 0 {
                debug!(discarded, window, "no start marker in resync window");
            }
            return Ok(ResyncOutcome::NotFound { discarded });
        };
        self.buf.advance(offset);

        while self.buf.len() < FRAME_SIZE {
            if let Fill::TimedOut = self.fill(FRAME_SIZE - self.buf.len())? {
                return Ok(ResyncOutcome::Incomplete { discarded: offset });
            }
        }

        let candidate = decode_frame(&self.buf[..FRAME_SIZE])?;
        if !candidate.valid {
            // Step past this marker so the next attempt searches beyond it.
            self.buf.advance(1);
            debug!(offset, "start marker without a valid frame");
            return Ok(ResyncOutcome::Rejected {
                discarded: offset + 1,
            });
        }

        match self.poll_frame()? {
            Some(ReadEvent::Frame(message)) => Ok(ResyncOutcome::Recovered {
                message,
                discarded: offset,
            }),
            Some(ReadEvent::Invalid(_)) => Ok(ResyncOutcome::Rejected {
                discarded: offset + FRAME_SIZE,
            }),
            None => Ok(ResyncOutcome::Incomplete { discarded: offset }),
        }
    }

    fn next_buffered(&mut self) -> Result<Option<ReadEvent>> {
        if self.buf.len() < FRAME_SIZE {
            return Ok(None);
        }

        let mut message = decode_frame(&self.buf[..FRAME_SIZE])?;
        if !message.valid {
            self.buf.advance(FRAME_SIZE);
            return Ok(Some(ReadEvent::Invalid(message)));
        }

        let extra = message.additional_data_size as usize;
        if extra > self.config.max_additional_data {
            self.buf.advance(FRAME_SIZE);
            return Err(FrameError::AdditionalDataTooLarge {
                size: extra,
                max: self.config.max_additional_data,
            });
        }
        if self.buf.len() < FRAME_SIZE + extra {
            return Ok(None);
        }

        self.buf.advance(FRAME_SIZE);
        if extra > 0 {
            message.additional_data = Some(self.buf.split_to(extra).freeze());
        }
        Ok(Some(ReadEvent::Frame(message)))
    }

    fn bytes_needed(&self) -> usize {
        if self.buf.len() < FRAME_SIZE {
            return FRAME_SIZE - self.buf.len();
        }
        let mut size = &self.buf[ADDITIONAL_SIZE_OFFSET..ADDITIONAL_SIZE_OFFSET + 4];
        let announced = size.get_u32_le() as usize;
        (FRAME_SIZE + announced).saturating_sub(self.buf.len()).max(1)
    }

    fn fill(&mut self, needed: usize) -> Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let want = needed.clamp(1, READ_CHUNK_SIZE);
        loop {
            match self.inner.read(&mut chunk[..want]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.bytes_read += n as u64;
                    return Ok(Fill::Data);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(Fill::TimedOut)
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Remove and return every byte received but not yet decoded.
    ///
    /// Lets another reader of the same stream continue exactly where this
    /// one stopped.
    pub fn take_buffered(&mut self) -> BytesMut {
        self.buf.split()
    }

    /// Put bytes back in front of anything still buffered.
    pub fn restore_buffered(&mut self, mut bytes: BytesMut) {
        if bytes.is_empty() {
            return;
        }
        bytes.extend_from_slice(&self.buf);
        self.buf = bytes;
    }

    /// Total bytes read from the underlying stream.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::{encode_command, encode_message};

    fn wire(messages: &[Message]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for message in messages {
            encode_message(message, &mut buf);
        }
        buf.to_vec()
    }

    fn expect_frame(event: ReadEvent) -> Message {
        match event {
            ReadEvent::Frame(message) => message,
            ReadEvent::Invalid(_) => panic!("expected a valid frame"),
        }
    }

    #[test]
    fn read_single_frame() {
        let bytes = encode_command(0x1001, &[1], 0.0, b"READY").unwrap();
        let mut reader = FrameReader::new(Cursor::new(bytes.to_vec()));

        let msg = expect_frame(reader.read_frame().unwrap());
        assert_eq!(msg.command_code, 0x1001);
        assert_eq!(msg.payload_str(), "READY");
        assert_eq!(reader.bytes_read(), FRAME_SIZE as u64);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn partial_read_handling() {
        let bytes = wire(&[Message::new(3), Message::new(4)]);
        let mut reader = FrameReader::new(ByteByByteReader { bytes, pos: 0 });

        assert_eq!(expect_frame(reader.read_frame().unwrap()).command_code, 3);
        assert_eq!(expect_frame(reader.read_frame().unwrap()).command_code, 4);
    }

    #[test]
    fn additional_data_is_consumed_before_next_frame() {
        let first = Message::new(0x6010).with_additional_data(vec![0xEE; 10]);
        let second = Message::new(0x6011);
        let mut reader = FrameReader::new(Cursor::new(wire(&[first, second])));

        let msg = expect_frame(reader.read_frame().unwrap());
        assert_eq!(msg.additional_data_size, 10);
        assert_eq!(msg.additional_data.as_deref(), Some(&[0xEE; 10][..]));

        let next = expect_frame(reader.read_frame().unwrap());
        assert!(next.valid);
        assert_eq!(next.command_code, 0x6011);
    }

    #[test]
    fn ignoring_additional_data_desyncs_the_next_frame() {
        let first = Message::new(0x6010).with_additional_data(vec![0xEE; 10]);
        let bytes = wire(&[first, Message::new(0x6011)]);

        // A reader that skipped the 10 announced bytes would decode here.
        let misaligned = decode_frame(&bytes[FRAME_SIZE..2 * FRAME_SIZE]).unwrap();
        assert!(!misaligned.valid);
    }

    #[test]
    fn invalid_frame_is_reported_and_consumed() {
        let mut garbage = vec![0x5Au8; FRAME_SIZE];
        garbage.extend(wire(&[Message::new(9)]));
        let mut reader = FrameReader::new(Cursor::new(garbage));

        assert!(matches!(reader.read_frame().unwrap(), ReadEvent::Invalid(_)));
        assert_eq!(expect_frame(reader.read_frame().unwrap()).command_code, 9);
    }

    #[test]
    fn oversized_additional_data_is_rejected() {
        let mut bytes = wire(&[Message::new(1)]);
        bytes[ADDITIONAL_SIZE_OFFSET..ADDITIONAL_SIZE_OFFSET + 4]
            .copy_from_slice(&1_000_000u32.to_le_bytes());
        let config = FrameConfig {
            max_additional_data: 1024,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes), config);

        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::AdditionalDataTooLarge { size: 1_000_000, max: 1024 }
        ));
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let bytes = wire(&[Message::new(1)]);
        let mut reader = FrameReader::new(Cursor::new(bytes[..60].to_vec()));
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn timeout_keeps_partial_frame() {
        let bytes = wire(&[Message::new(0x3010)]);
        let mut reader = FrameReader::new(StallingReader {
            bytes,
            pos: 0,
            stall_at: 50,
            stalled: false,
        });

        assert!(reader.poll_frame().unwrap().is_none());
        assert_eq!(reader.buffered(), 50);
        let msg = expect_frame(reader.poll_frame().unwrap().unwrap());
        assert_eq!(msg.command_code, 0x3010);
    }

    #[test]
    fn reads_never_overrun_the_current_frame() {
        let bytes = wire(&[Message::new(1), Message::new(2)]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        reader.read_frame().unwrap();
        assert_eq!(reader.get_ref().position(), FRAME_SIZE as u64);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn interrupted_read_retries() {
        let bytes = wire(&[Message::new(8)]);
        let mut reader = FrameReader::new(InterruptedThenData {
            state: 0,
            bytes,
            pos: 0,
        });
        assert_eq!(expect_frame(reader.read_frame().unwrap()).command_code, 8);
    }

    #[test]
    fn resync_finds_marker_after_garbage() {
        let mut bytes = vec![0x11u8; 37];
        bytes.extend(wire(&[Message::new(0x1003).with_payload(b"IDLE")]));
        let mut reader = FrameReader::new(Cursor::new(bytes));

        match reader.resync().unwrap() {
            ResyncOutcome::Recovered { message, discarded } => {
                assert_eq!(discarded, 37);
                assert_eq!(message.command_code, 0x1003);
                assert_eq!(message.payload_str(), "IDLE");
            }
            other => panic!("expected recovery, got {other:?}"),
        }
    }

    #[test]
    fn resync_without_marker_discards_window() {
        let bytes = vec![0x22u8; 600];
        let mut reader = FrameReader::new(Cursor::new(bytes));

        match reader.resync().unwrap() {
            ResyncOutcome::NotFound { discarded } => assert_eq!(discarded, 512 - 3),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert_eq!(reader.buffered(), 3);
    }

    #[test]
    fn resync_skips_false_marker() {
        let mut bytes = vec![0u8; 10];
        bytes.extend_from_slice(&START_MARKER_BYTES);
        bytes.extend(vec![0x33u8; 200]);
        bytes.extend(wire(&[Message::new(0x7001)]));
        let mut reader = FrameReader::new(Cursor::new(bytes));

        assert!(matches!(
            reader.resync().unwrap(),
            ResyncOutcome::Rejected { discarded: 11 }
        ));
        match reader.resync().unwrap() {
            ResyncOutcome::Recovered { message, .. } => assert_eq!(message.command_code, 0x7001),
            other => panic!("expected recovery, got {other:?}"),
        }
    }

    #[test]
    fn resync_recovers_frame_with_additional_data() {
        let mut bytes = vec![0x44u8; 5];
        bytes.extend(wire(&[
            Message::new(0x6010).with_additional_data(vec![1u8, 2, 3, 4]),
            Message::new(0x6011),
        ]));
        let mut reader = FrameReader::new(Cursor::new(bytes));

        match reader.resync().unwrap() {
            ResyncOutcome::Recovered { message, discarded } => {
                assert_eq!(discarded, 5);
                assert_eq!(message.additional_data.as_deref(), Some(&[1u8, 2, 3, 4][..]));
            }
            other => panic!("expected recovery, got {other:?}"),
        }
        assert_eq!(expect_frame(reader.read_frame().unwrap()).command_code, 0x6011);
    }

    #[test]
    fn buffered_bytes_can_be_handed_over_and_restored() {
        let bytes = wire(&[Message::new(0x3010), Message::new(0x3011)]);
        let mut reader = FrameReader::new(StallingReader {
            bytes,
            pos: 0,
            stall_at: 50,
            stalled: false,
        });
        assert!(reader.poll_frame().unwrap().is_none());

        let taken = reader.take_buffered();
        assert_eq!(taken.len(), 50);
        assert_eq!(reader.buffered(), 0);

        reader.restore_buffered(taken);
        assert_eq!(expect_frame(reader.read_frame().unwrap()).command_code, 0x3010);
        assert_eq!(expect_frame(reader.read_frame().unwrap()).command_code, 0x3011);
    }

    #[test]
    fn repeated_resync_walks_past_long_garbage() {
        let mut bytes = vec![0x11u8; 1300];
        bytes.extend(wire(&[Message::new(0x1003)]));
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let mut attempts = 0;
        let message = loop {
            attempts += 1;
            match reader.resync().unwrap() {
                ResyncOutcome::Recovered { message, .. } => break message,
                ResyncOutcome::NotFound { .. } => assert!(attempts < 10),
                other => panic!("unexpected outcome {other:?}"),
            }
        };
        assert_eq!(message.command_code, 0x1003);
        assert!(attempts >= 3);
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_pipe() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer
            .send_command(0x5002, &[0, 0, 0, 0, 0, 0, 0x8000_0000], 0.0, &[])
            .unwrap();
        let msg = expect_frame(reader.read_frame().unwrap());
        assert_eq!(msg.command_code, 0x5002);
        assert!(msg.has_callback_flag());
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct StallingReader {
        bytes: Vec<u8>,
        pos: usize,
        stall_at: usize,
        stalled: bool,
    }

    impl Read for StallingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.stall_at && !self.stalled {
                self.stalled = true;
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            let limit = if self.stalled {
                self.bytes.len()
            } else {
                self.stall_at
            };
            let n = (limit - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct InterruptedThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
