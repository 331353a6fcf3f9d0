//! Readiness multiplexing for WebSocket connections.
//!
//! A [`Multiplexer`] owns one level-triggered epoll instance plus a
//! [`Registry`] mapping each descriptor to its [`Connection`]. Any thread may
//! register or deregister; one dispatch thread calls [`Multiplexer::wait`].
//!
//! [`Connection`]: sockrelay_transport::Connection

#[cfg(target_os = "linux")]
pub mod epoll;
pub mod error;
#[cfg(unix)]
pub mod registry;

#[cfg(test)]
mod testing;

#[cfg(target_os = "linux")]
pub use epoll::{Multiplexer, MultiplexerConfig, DEFAULT_BATCH_SIZE};
pub use error::{MuxError, RegistrationFailure, Result};
#[cfg(unix)]
pub use registry::Registry;
