use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::Result;

/// A readable source whose blocking reads can be bounded by a timeout.
///
/// The background reader relies on this to wake up periodically and check
/// for pause or shutdown requests while the instrument is silent.
pub trait PollRead: Read + Send {
    /// Bound subsequent reads by `timeout` (`None` blocks indefinitely).
    fn set_poll_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

/// A connected instrument stream.
///
/// Wraps one of the two TCP sockets (command or live-data) owned by the
/// [`ConnectionManager`](crate::ConnectionManager).
pub struct InstrumentStream {
    inner: TcpStream,
}

impl Read for InstrumentStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for InstrumentStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl PollRead for InstrumentStream {
    fn set_poll_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }
}

impl InstrumentStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self { inner: stream }
    }

    /// Set read timeout on the underlying socket.
    ///
    /// The timeout is a socket option, so it is shared by every clone of
    /// this stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying socket.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.inner.try_clone()?;
        Ok(Self::from_tcp(cloned))
    }

    /// Current read timeout of the underlying socket.
    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        self.inner.read_timeout().map_err(Into::into)
    }

    /// Switch the underlying socket in or out of non-blocking mode.
    ///
    /// Like the timeouts, this is shared by every clone.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner.set_nonblocking(nonblocking).map_err(Into::into)
    }

    /// Shut down both halves of the connection.
    ///
    /// Unblocks any clone currently parked in a read.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown(Shutdown::Both).map_err(Into::into)
    }
}

impl std::fmt::Debug for InstrumentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("InstrumentStream");
        dbg.field("type", &"tcp");
        if let Ok(addr) = self.inner.peer_addr() {
            dbg.field("peer", &addr);
        }
        dbg.finish()
    }
}
