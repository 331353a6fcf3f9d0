//! WebSocket connections over std TCP streams.
//!
//! This is the lowest layer of sockrelay. It provides:
//! - [`Connection`]: a WebSocket whose OS descriptor is captured when the
//!   connection is built, so readiness facilities can key on it
//! - [`upgrade`] / [`dial`]: server and client handshakes
//! - [`raise_nofile_limit`]: the process-wide descriptor precondition
//!
//! Everything else builds on [`Connection`].

pub mod connection;
pub mod error;
#[cfg(unix)]
pub mod limits;
pub mod tcp;

pub use connection::{Connection, SocketStream, DEFAULT_WRITE_TIMEOUT};
pub use error::{Result, TransportError};
#[cfg(unix)]
pub use limits::{nofile_limit, raise_nofile_limit, FdLimit};
pub use tcp::{bind, dial, upgrade, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_UPGRADE_PATH};

pub use tungstenite::protocol::Role;
pub use tungstenite::Message;
