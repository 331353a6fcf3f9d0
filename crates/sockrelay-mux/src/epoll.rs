use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use sockrelay_transport::Connection;
use tracing::{debug, info};

use crate::error::{MuxError, Result};
use crate::registry::Registry;

/// Default number of readiness events collected per wait.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Registration count interval at which the total is logged.
const LOG_EVERY: usize = 100;

/// Readable, or the peer hung up (fully or its write half).
const INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) as u32;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Maximum events returned by one `wait`.
    pub batch_size: usize,
    /// Optional ceiling on registered connections, enforced before the OS call.
    pub max_connections: Option<usize>,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_connections: None,
        }
    }
}

/// Level-triggered epoll over a registry of WebSocket connections.
///
/// `add` and `remove` may be called from any thread; `wait` is meant for the
/// single dispatch thread.
pub struct Multiplexer {
    epoll: OwnedFd,
    registry: Arc<Registry>,
    config: MultiplexerConfig,
}

impl Multiplexer {
    /// Create a multiplexer with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(MultiplexerConfig::default())
    }

    /// Create a multiplexer with explicit configuration.
    pub fn with_config(config: MultiplexerConfig) -> Result<Self> {
        // SAFETY: epoll_create1 takes no pointers; EPOLL_CLOEXEC is a valid flag.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(MuxError::Init(io::Error::last_os_error()));
        }
        // SAFETY: `fd` was just returned by epoll_create1 and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(epoll_fd = fd, batch_size = config.batch_size, "created epoll instance");

        Ok(Self {
            epoll,
            registry: Arc::new(Registry::new()),
            config: MultiplexerConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
        })
    }

    /// Register a connection for readable / hang-up readiness.
    ///
    /// The ceiling and duplicate checks run under the registry's write lock
    /// together with the OS call, so concurrent adds never exceed
    /// `max_connections` and a rejected descriptor never reaches epoll.
    pub fn add(&self, connection: Arc<Connection>) -> Result<()> {
        let fd = connection.fd();
        let epoll = self.epoll.as_raw_fd();

        let total = self
            .registry
            .insert_bounded(connection, self.config.max_connections, |fd| {
                let mut event = libc::epoll_event {
                    events: INTEREST,
                    u64: fd as u64,
                };
                // SAFETY: `event` is a valid epoll_event for the duration of the call
                // and `epoll` is the open descriptor owned by `self`.
                let rc = unsafe { libc::epoll_ctl(epoll, libc::EPOLL_CTL_ADD, fd, &mut event) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            })
            .map_err(|reason| MuxError::Registration { fd, reason })?;

        if total % LOG_EVERY == 0 {
            info!(total, "registered connections");
        }
        Ok(())
    }

    /// Deregister a connection.
    ///
    /// The registry entry is deleted even when the OS call fails; that failure
    /// is still returned so the caller can log it.
    pub fn remove(&self, connection: &Connection) -> Result<()> {
        let fd = connection.fd();
        // SAFETY: EPOLL_CTL_DEL ignores the event pointer, null is permitted since
        // Linux 2.6.9; `self.epoll` is an open epoll descriptor.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        let os_error = (rc != 0).then(io::Error::last_os_error);

        if self.registry.remove(fd, connection.id()).is_some() {
            let total = self.registry.len();
            if total % LOG_EVERY == 0 {
                info!(total, "registered connections");
            }
        }

        match os_error {
            Some(source) => Err(MuxError::Deregistration { fd, source }),
            None => Ok(()),
        }
    }

    /// Block until registered connections are ready or `timeout` elapses.
    ///
    /// Collects at most `batch_size` events. An interrupted wait returns an
    /// empty batch. `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Arc<Connection>>> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.config.batch_size];
        let capacity = libc::c_int::try_from(events.len()).unwrap_or(libc::c_int::MAX);

        // SAFETY: `events` holds `capacity` initialized epoll_event slots that the
        // kernel may overwrite; `self.epoll` is an open epoll descriptor.
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                capacity,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(MuxError::Wait(err));
        }

        let ready = usize::try_from(n).unwrap_or(0);
        let fds: Vec<RawFd> = events[..ready]
            .iter()
            .map(|event| event.u64 as RawFd)
            .collect();
        Ok(self.registry.resolve(&fds))
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Shared handle to the connection registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Descriptor of the epoll instance itself.
    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("epoll_fd", &self.epoll.as_raw_fd())
            .field("registered", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            // Round up so a sub-millisecond timeout still sleeps.
            let millis = timeout.as_micros().div_ceil(1000);
            libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
        }
    }
}
