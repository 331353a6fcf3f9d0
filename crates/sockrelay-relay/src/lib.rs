//! Consumer side of sockrelay.
//!
//! Connections arrive through the [`Gateway`], are registered with a shared
//! [`Multiplexer`](sockrelay_mux::Multiplexer), and are drained by one
//! [`DispatchLoop`] thread. Decoded work packets run on a bounded
//! [`WorkerPool`] through a [`Processor`]; each result is written back on the
//! connection the packet came from.
//!
//! [`RelayServer`] wires the pieces together.

pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod processor;
pub mod server;

#[cfg(test)]
mod testing;

pub use dispatch::{DispatchConfig, DispatchLoop, DrainOutcome};
pub use error::{ProcessingError, RelayError, Result};
pub use gateway::{register, Gateway, GatewayConfig};
pub use pool::{run_job, Job, WorkerPool};
pub use processor::{default_output_path, CommandProcessor, Processor};
pub use server::{RelayConfig, RelayHandle, RelayServer, DEFAULT_LISTEN_ADDR};
