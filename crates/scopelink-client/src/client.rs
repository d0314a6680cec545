use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use scopelink_frame::{code_name, decode_frame, encode_command, Message, CALLBACK_FLAG, FRAME_SIZE, MAX_PARAMS};
use scopelink_transport::{Channel, ConnectionManager, ConnectionState};
use tracing::{debug, info, warn};

use crate::background::{BackgroundReader, ReaderState};
use crate::config::ClientConfig;
use crate::dispatcher::{CallbackId, Dispatcher};
use crate::error::{ClientError, Result};
use crate::stats::{DispatcherStats, EngineStats, ReaderStats};

/// Outcome of a correlated request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The instrument answered.
    Received(Message),
    /// No answer carrying `code` arrived within `after`.
    TimedOut { code: u32, after: Duration },
}

impl Reply {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Reply::TimedOut { .. })
    }

    pub fn message(self) -> Option<Message> {
        match self {
            Reply::Received(message) => Some(message),
            Reply::TimedOut { .. } => None,
        }
    }

    /// Treat a missing answer as [`ClientError::Timeout`].
    pub fn into_result(self) -> Result<Message> {
        match self {
            Reply::Received(message) => Ok(message),
            Reply::TimedOut { after, .. } => Err(ClientError::Timeout(after)),
        }
    }
}

/// Client for one instrument connection.
///
/// Owns the connection, the dispatcher and the background reader. Any
/// number of threads may send concurrently; responses are correlated by
/// command code.
pub struct CommandClient {
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    reader: BackgroundReader,
    send_lock: Mutex<()>,
    config: ClientConfig,
}

impl CommandClient {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_config(config.dispatcher.clone()));
        let reader = BackgroundReader::new(Arc::clone(&dispatcher), config.reader.clone());
        Self {
            connection: Arc::new(ConnectionManager::new()),
            dispatcher,
            reader,
            send_lock: Mutex::new(()),
            config,
        }
    }

    fn lock_send(&self) -> MutexGuard<'_, ()> {
        self.send_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect both channels and start the background reader.
    pub fn connect(&self, ip: &str, port: u16) -> Result<()> {
        self.connect_with_timeout(ip, port, self.config.connect_timeout)
    }

    pub fn connect_with_timeout(&self, ip: &str, port: u16, timeout: Duration) -> Result<()> {
        self.reader.stop(self.config.reader.stop_timeout);
        self.connection.connect(ip, port, timeout)?;

        let started = self
            .connection
            .command_reader()
            .map_err(ClientError::from)
            .and_then(|stream| self.reader.start(stream));
        if let Err(err) = started {
            self.connection.disconnect();
            return Err(err);
        }

        info!(ip, port, "client connected");
        Ok(())
    }

    /// Stop the reader, then close both channels.
    pub fn disconnect(&self) {
        self.reader.stop(self.config.reader.stop_timeout);
        if self.connection.is_connected() {
            self.connection.disconnect();
            info!("client disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Send an encoded request and wait for the reply carrying `expected_code`.
    pub fn send_command(&self, bytes: &[u8], expected_code: u32, timeout: Duration) -> Result<Reply> {
        if !self.connection.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if !self.reader.is_running() {
            return Err(ClientError::ReaderStopped);
        }

        let pending = self.dispatcher.register_pending_request(expected_code);
        let sent = {
            let _guard = self.lock_send();
            self.connection.send_bytes(Channel::Command, bytes)
        };
        if let Err(err) = sent {
            self.dispatcher.release(&pending);
            return Err(err.into());
        }

        let started = Instant::now();
        let answer = pending.wait(timeout);
        self.dispatcher.release(&pending);

        match answer {
            Some(message) => {
                debug!(code = expected_code, status = message.status_code, "reply received");
                Ok(Reply::Received(message))
            }
            None => {
                warn!(code = expected_code, name = code_name(expected_code), ?timeout, "request timed out");
                Ok(Reply::TimedOut {
                    code: expected_code,
                    after: started.elapsed(),
                })
            }
        }
    }

    /// Encode a request with the reply flag set and wait for the same code.
    pub fn request(&self, code: u32, params: &[i64], value: f64, data: &[u8], timeout: Duration) -> Result<Reply> {
        let frame = encode_command(code, &with_reply_flag(params), value, data)?;
        self.send_command(&frame, code, timeout)
    }

    /// Legacy synchronous exchange on the command channel.
    ///
    /// Pauses the reader, sends `bytes`, reads the next frame directly and
    /// resumes the reader whatever the outcome. A frame the reader had only
    /// partly received is completed and dispatched first; the returned frame
    /// is the first one after it, whatever its code.
    pub fn exchange_blocking(&self, bytes: &[u8], timeout: Duration) -> Result<Message> {
        if !self.connection.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if !self.reader.pause(self.config.pause_timeout) {
            warn!("exchanging while background reader may still be reading");
        }
        let result = self.exchange_paused(bytes, timeout);
        self.reader.resume();
        result
    }

    fn exchange_paused(&self, bytes: &[u8], timeout: Duration) -> Result<Message> {
        let _guard = self.lock_send();
        let mut carried = self.reader.take_buffered();
        if let Err(err) = self.connection.send_bytes(Channel::Command, bytes) {
            self.reader.restore_buffered(carried);
            return Err(err.into());
        }

        let deadline = Instant::now() + timeout;
        while !carried.is_empty() {
            let earlier = self.read_exchange_frame(&mut carried, deadline, timeout)?;
            debug!(code = earlier.command_code, "completed frame the reader had started");
            self.dispatcher.dispatch(earlier);
        }

        let message = self.read_exchange_frame(&mut carried, deadline, timeout)?;
        debug!(
            code = message.command_code,
            extra = message.additional_data_size,
            "synchronous exchange complete"
        );
        Ok(message)
    }

    /// Decode one frame from `buf`, topping it up from the command channel.
    fn read_exchange_frame(&self, buf: &mut BytesMut, deadline: Instant, timeout: Duration) -> Result<Message> {
        self.fill_exchange(buf, FRAME_SIZE, deadline, timeout)?;
        let mut message = decode_frame(&buf[..FRAME_SIZE])?;
        if !message.valid {
            // Misaligned; the reader resynchronizes after resume.
            buf.clear();
            return Err(ClientError::InvalidFrame {
                code: message.command_code,
            });
        }

        let extra = message.additional_data_size as usize;
        if extra > self.config.reader.max_additional_data {
            buf.clear();
            return Err(scopelink_frame::FrameError::AdditionalDataTooLarge {
                size: extra,
                max: self.config.reader.max_additional_data,
            }
            .into());
        }
        self.fill_exchange(buf, FRAME_SIZE + extra, deadline, timeout)?;
        buf.advance(FRAME_SIZE);
        if extra > 0 {
            message.additional_data = Some(buf.split_to(extra).freeze());
        }
        Ok(message)
    }

    fn fill_exchange(&self, buf: &mut BytesMut, len: usize, deadline: Instant, timeout: Duration) -> Result<()> {
        if buf.len() >= len {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::Timeout(timeout));
        }
        let more = self
            .connection
            .receive_bytes(Channel::Command, len - buf.len(), Some(remaining))?;
        buf.extend_from_slice(&more);
        Ok(())
    }

    /// Read raw bytes from the live-data channel.
    pub fn read_live(&self, len: usize, timeout: Duration) -> Result<Bytes> {
        Ok(self.connection.receive_bytes(Channel::Live, len, Some(timeout))?)
    }

    pub fn register_callback<F>(&self, code: u32, handler: F) -> CallbackId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.dispatcher.register_callback(code, handler)
    }

    pub fn unregister_callback(&self, code: u32, id: CallbackId) -> bool {
        self.dispatcher.unregister_callback(code, id)
    }

    pub fn pause(&self, timeout: Duration) -> bool {
        self.reader.pause(timeout)
    }

    pub fn resume(&self) {
        self.reader.resume();
    }

    pub fn reader_state(&self) -> ReaderState {
        self.reader.state()
    }

    /// Shared dispatcher, for collaborators that consume notifications.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn recv_unsolicited(&self, timeout: Duration) -> Option<Message> {
        self.dispatcher.recv_unsolicited(timeout)
    }

    pub fn reader_stats(&self) -> ReaderStats {
        self.reader.stats()
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            connected: self.is_connected(),
            reader_state: self.reader.state(),
            unsolicited_pending: self.dispatcher.unsolicited_len(),
            reader: self.reader.stats(),
            dispatcher: self.dispatcher.stats(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Default for CommandClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for CommandClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandClient")
            .field("connection", &self.connection)
            .field("reader", &self.reader.state())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Pad `params` to the full word count and set the reply flag on the last word.
///
/// Lists that are too long or out of range are passed through untouched so
/// the encoder reports them.
fn with_reply_flag(params: &[i64]) -> Vec<i64> {
    let mut words = params.to_vec();
    if words.len() > MAX_PARAMS {
        return words;
    }
    words.resize(MAX_PARAMS, 0);
    let last = words[MAX_PARAMS - 1];
    if (i64::from(i32::MIN)..=i64::from(u32::MAX)).contains(&last) {
        words[MAX_PARAMS - 1] = i64::from(last as u32 | CALLBACK_FLAG);
    }
    words
}
