use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use tungstenite::protocol::Role;
use tungstenite::{Message, WebSocket};

use crate::error::{Result, TransportError};

/// Default time a writer waits for a full socket buffer to drain before giving up.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// TCP stream under one side of a [`Connection`].
///
/// Handshakes run over an unmuted stream. Once a connection is built, its read
/// side is muted: whatever tungstenite queues there (pong and close replies)
/// is dropped, and the connection sends those replies from its write side.
#[derive(Debug)]
pub struct SocketStream {
    inner: TcpStream,
    muted: bool,
}

impl SocketStream {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            muted: false,
        }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    /// Block until the socket accepts more bytes, an error is pending, or
    /// `timeout` elapses.
    #[cfg(unix)]
    fn wait_writable(&self, timeout: Duration) -> io::Result<()> {
        let mut pollfd = libc::pollfd {
            fd: self.inner.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_micros().div_ceil(1000))
            .unwrap_or(libc::c_int::MAX);
        // SAFETY: `pollfd` is a valid pollfd for the duration of the call and the
        // count of 1 matches it.
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn wait_writable(&self, timeout: Duration) -> io::Result<()> {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(())
    }
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.muted {
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.muted {
            return Ok(());
        }
        self.inner.flush()
    }
}

/// A WebSocket connection over TCP with its descriptor captured at construction.
///
/// Reads and writes go through separate WebSocket states on two handles of the
/// same socket, each behind its own lock. A reader never waits for a writer,
/// and concurrent writers never interleave frames on the wire.
pub struct Connection {
    id: u64,
    #[cfg(unix)]
    fd: RawFd,
    role: Role,
    peer: Option<SocketAddr>,
    reader: Mutex<WebSocket<SocketStream>>,
    writer: Mutex<WebSocket<SocketStream>>,
    open: AtomicBool,
    write_timeout: Duration,
}

impl Connection {
    /// Wrap an already handshaken WebSocket.
    ///
    /// The socket keeps whatever the handshake read past the upgrade response
    /// and becomes the read side; a cloned handle becomes the write side.
    pub fn new(mut socket: WebSocket<SocketStream>, role: Role) -> Result<Self> {
        let stream = socket.get_ref().get_ref();
        let peer = stream.peer_addr().ok();
        #[cfg(unix)]
        let fd = stream.as_raw_fd();
        let writer = WebSocket::from_raw_socket(SocketStream::new(stream.try_clone()?), role, None);
        socket.get_mut().muted = true;

        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            #[cfg(unix)]
            fd,
            role,
            peer,
            reader: Mutex::new(socket),
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Wrap a TCP stream that already speaks WebSocket frames, skipping the handshake.
    pub fn from_stream(stream: TcpStream, role: Role) -> Result<Self> {
        Self::new(
            WebSocket::from_raw_socket(SocketStream::new(stream), role, None),
            role,
        )
    }

    /// Override how long `send` waits for a full socket buffer to drain.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Process-unique connection id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS descriptor of the underlying socket.
    #[cfg(unix)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Remote address, when the socket reported one at construction.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Which side of the handshake this connection played.
    pub fn role(&self) -> Role {
        self.role
    }

    /// False once `close` has been called or a read observed the peer closing.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Read the next application message.
    ///
    /// Returns `Ok(None)` when the socket has no complete message yet
    /// (non-blocking socket) or its read timeout elapsed (blocking socket).
    /// Ping and pong frames are consumed here; a close frame surfaces as
    /// `TransportError::Closed`.
    pub fn read_message(&self) -> Result<Option<Message>> {
        let mut socket = lock(&self.reader);
        loop {
            match socket.read() {
                Ok(message @ (Message::Text(_) | Message::Binary(_))) => return Ok(Some(message)),
                Ok(Message::Ping(payload)) => self.answer_ping(payload),
                Ok(Message::Pong(_) | Message::Frame(_)) => {
                    trace!(conn_id = self.id, "control frame consumed");
                }
                Ok(Message::Close(_)) => {
                    self.open.store(false, Ordering::Release);
                    return Err(TransportError::Closed);
                }
                Err(err) => {
                    let err = TransportError::from(err);
                    if err.is_timeout() {
                        return Ok(None);
                    }
                    if matches!(err, TransportError::Closed) {
                        self.open.store(false, Ordering::Release);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Pong from the write side, skipped while a writer holds it.
    fn answer_ping(&self, payload: Vec<u8>) {
        let mut writer = match self.writer.try_lock() {
            Ok(writer) => writer,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                trace!(conn_id = self.id, "write side busy, ping left unanswered");
                return;
            }
        };
        match writer.send(Message::Pong(payload)) {
            Ok(()) => trace!(conn_id = self.id, "ping answered"),
            Err(err) => trace!(conn_id = self.id, error = %err, "pong not flushed"),
        }
    }

    /// Write one message and flush it.
    ///
    /// On a non-blocking socket a full kernel buffer is waited on until the
    /// write timeout elapses. Only other writers of this connection wait
    /// meanwhile.
    pub fn send(&self, message: Message) -> Result<()> {
        let mut socket = lock(&self.writer);
        match socket.send(message) {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                self.finish_flush(&mut socket)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn finish_flush(&self, socket: &mut WebSocket<SocketStream>) -> Result<()> {
        let deadline = Instant::now() + self.write_timeout;
        loop {
            match socket.flush() {
                Ok(()) => return Ok(()),
                Err(tungstenite::Error::Io(err))
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransportError::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "socket not writable before write timeout",
                        )));
                    }
                    socket.get_ref().wait_writable(remaining)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Set the read timeout of the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        lock(&self.reader)
            .get_ref()
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(Into::into)
    }

    /// Close the connection: close frame if the write side is free, then
    /// socket shutdown.
    ///
    /// Never waits on a reader or a writer; a writer blocked on a full buffer
    /// fails promptly once the socket is shut down.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.writer.try_lock() {
            Ok(mut writer) => {
                let _ = writer.close(None);
                let _ = writer.flush();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut writer = poisoned.into_inner();
                let _ = writer.close(None);
                let _ = writer.flush();
            }
            Err(TryLockError::WouldBlock) => {
                trace!(conn_id = self.id, "write side busy, close frame skipped");
            }
        }
        self.shutdown_socket();
        debug!(conn_id = self.id, peer = ?self.peer, "connection closed");
    }

    #[cfg(unix)]
    fn shutdown_socket(&self) {
        // SAFETY: `self.fd` is owned by the read side's stream, which lives as long
        // as `self`; shutdown takes no pointers.
        unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
    }

    #[cfg(not(unix))]
    fn shutdown_socket(&self) {
        let _ = lock(&self.writer)
            .get_ref()
            .get_ref()
            .shutdown(std::net::Shutdown::Both);
    }
}

// Poison is ignored: tungstenite owns the frame state, not the guard holder.
fn lock(socket: &Mutex<WebSocket<SocketStream>>) -> MutexGuard<'_, WebSocket<SocketStream>> {
    socket
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Connection");
        dbg.field("id", &self.id);
        #[cfg(unix)]
        dbg.field("fd", &self.fd);
        dbg.field("role", &self.role)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
