use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::stream::InstrumentStream;

/// Which of the two instrument sockets an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Command/response socket (`port`).
    Command,
    /// Live-data socket (`port + 1`).
    Live,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::Command => "command",
            Channel::Live => "live",
        }
    }
}

/// Snapshot of the connection bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub ip: Option<Ipv4Addr>,
    pub command_port: u16,
    pub live_port: u16,
    pub connected: bool,
}

#[derive(Default)]
struct Inner {
    command: Option<InstrumentStream>,
    live: Option<InstrumentStream>,
    state: ConnectionState,
}

impl Inner {
    fn stream_mut(&mut self, channel: Channel) -> Result<&mut InstrumentStream> {
        let stream = match channel {
            Channel::Command => self.command.as_mut(),
            Channel::Live => self.live.as_mut(),
        };
        stream.ok_or(TransportError::NotConnected)
    }

    fn close(&mut self) {
        for (channel, stream) in [
            (Channel::Command, self.command.take()),
            (Channel::Live, self.live.take()),
        ] {
            if let Some(stream) = stream {
                if let Err(err) = stream.shutdown() {
                    debug!(channel = channel.name(), %err, "error closing socket");
                }
            }
        }
        self.state.connected = false;
    }
}

/// Owns the command and live-data sockets of one instrument.
///
/// A single mutex guards connect/disconnect/send/receive so they never
/// interleave. Both sockets are open or both are closed.
pub struct ConnectionManager {
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    /// Default timeout for each socket connect.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect the command socket on `port` and the live socket on `port + 1`.
    ///
    /// An existing connection is closed first. If either socket fails, whatever
    /// was opened is torn down before the error is returned.
    pub fn connect(&self, ip: &str, port: u16, timeout: Duration) -> Result<()> {
        let addr = parse_ipv4(ip)?;
        let live_port = live_port_for(port)?;

        let mut inner = self.lock();
        if inner.state.connected {
            info!(ip = %addr, port, "already connected, reconnecting");
            inner.close();
        }

        let command = open_socket(SocketAddr::from((addr, port)), timeout)?;
        let live = match open_socket(SocketAddr::from((addr, live_port)), timeout) {
            Ok(live) => live,
            Err(err) => {
                if let Err(close_err) = command.shutdown() {
                    debug!(%close_err, "error closing command socket after failed connect");
                }
                return Err(err);
            }
        };

        inner.command = Some(command);
        inner.live = Some(live);
        inner.state = ConnectionState {
            ip: Some(addr),
            command_port: port,
            live_port,
            connected: true,
        };
        info!(ip = %addr, command_port = port, live_port, "connected to instrument");
        Ok(())
    }

    /// Close both sockets. Safe to call when already disconnected.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if inner.state.connected {
            info!(
                ip = ?inner.state.ip,
                port = inner.state.command_port,
                "disconnecting from instrument"
            );
        }
        inner.close();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state.connected
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    /// Write all of `bytes` to the selected socket.
    pub fn send_bytes(&self, channel: Channel, bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let stream = inner.stream_mut(channel)?;
        let result = stream.write_all(bytes).and_then(|()| stream.flush());
        if let Err(err) = result {
            warn!(channel = channel.name(), %err, "send failed, marking disconnected");
            inner.close();
            return Err(TransportError::Io(err));
        }
        debug!(channel = channel.name(), bytes = bytes.len(), "sent");
        Ok(())
    }

    /// Read exactly `len` bytes from the selected socket.
    ///
    /// With a `timeout`, a read that does not complete in time returns
    /// [`TransportError::Timeout`] and leaves the connection open; any bytes
    /// read so far are discarded. A zero timeout polls without blocking.
    /// The socket's previous read timeout is restored afterwards, since it is
    /// shared with the reader thread's clone.
    pub fn receive_bytes(
        &self,
        channel: Channel,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let mut inner = self.lock();
        let stream = inner.stream_mut(channel)?;
        let poll = timeout == Some(Duration::ZERO);
        let previous = stream.read_timeout()?;
        if poll {
            stream.set_nonblocking(true)?;
        } else {
            stream.set_read_timeout(timeout)?;
        }

        let result = read_exact_or_timeout(stream, len);
        let restored = if poll {
            stream.set_nonblocking(false)
        } else {
            stream.set_read_timeout(previous)
        };
        if let Err(err) = restored {
            debug!(channel = channel.name(), %err, "failed to restore read mode");
        }

        match result {
            Ok(bytes) => Ok(bytes),
            Err(ReadFailure::TimedOut) => Err(TransportError::Timeout(timeout.unwrap_or_default())),
            Err(ReadFailure::Closed) => {
                warn!(channel = channel.name(), "peer closed connection");
                inner.close();
                Err(TransportError::Closed)
            }
            Err(ReadFailure::Io(err)) => {
                warn!(channel = channel.name(), %err, "receive failed, marking disconnected");
                inner.close();
                Err(TransportError::Io(err))
            }
        }
    }

    /// Clone of the command socket for a dedicated reader thread.
    pub fn command_reader(&self) -> Result<InstrumentStream> {
        let mut inner = self.lock();
        inner.stream_mut(Channel::Command)?.try_clone()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.lock().close();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}

/// Parse a dotted-quad IPv4 address.
pub fn parse_ipv4(ip: &str) -> Result<Ipv4Addr> {
    ip.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| TransportError::InvalidAddress(ip.to_string()))
}

/// Live-data port for a command port, rejecting ports whose successor overflows.
pub fn live_port_for(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(TransportError::InvalidPort(u32::from(port)));
    }
    port.checked_add(1)
        .ok_or(TransportError::InvalidPort(u32::from(port)))
}

fn open_socket(addr: SocketAddr, timeout: Duration) -> Result<InstrumentStream> {
    let connect_err = |source| TransportError::Connect { addr, source };
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(connect_err)?;
    let configured = stream
        .set_read_timeout(None)
        .and_then(|()| stream.set_write_timeout(None))
        .and_then(|()| stream.set_nodelay(true));
    if let Err(err) = configured {
        let _ = stream.shutdown(std::net::Shutdown::Both);
        return Err(connect_err(err));
    }
    debug!(%addr, "socket connected");
    Ok(InstrumentStream::from_tcp(stream))
}

enum ReadFailure {
    TimedOut,
    Closed,
    Io(std::io::Error),
}

fn read_exact_or_timeout<R: Read>(reader: &mut R, len: usize) -> std::result::Result<Bytes, ReadFailure> {
    let mut buf = BytesMut::zeroed(len);
    let mut filled = 0usize;
    while filled < len {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ReadFailure::Closed),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ReadFailure::TimedOut)
            }
            Err(err) => return Err(ReadFailure::Io(err)),
        }
    }
    Ok(buf.freeze())
}
