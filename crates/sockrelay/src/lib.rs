//! Relay work packets from HTTP producers to WebSocket consumers.
//!
//! Producers accept uploads over HTTP and push a work packet per file through
//! a [`link::ResilientLink`]. Consumers accept many long-lived WebSocket
//! connections, watch them all through one epoll instance, run each packet
//! through a processor on a worker pool, and answer on the same connection.
//!
//! # Crate Structure
//!
//! - [`transport`]: WebSocket connections with first-class descriptors
//! - [`frame`]: work packet and result wire format
//! - [`mux`]: epoll readiness multiplexer and connection registry
//! - [`relay`]: consumer gateway, dispatch loop and worker pool
//! - [`link`]: producer link with one-shot redial and result fan-out
//! - [`http`]: producer HTTP surface (behind the `http` feature)

/// Re-export transport types.
pub mod transport {
    pub use sockrelay_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use sockrelay_frame::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use sockrelay_mux::*;
}

/// Re-export consumer types.
pub mod relay {
    pub use sockrelay_relay::*;
}

/// Re-export producer link types.
pub mod link {
    pub use sockrelay_link::*;
}

#[cfg(feature = "http")]
pub mod http;
