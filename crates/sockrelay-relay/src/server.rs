use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use sockrelay_mux::{Multiplexer, MultiplexerConfig};
use sockrelay_transport::raise_nofile_limit;
use tracing::{error, info};

use crate::dispatch::{DispatchConfig, DispatchLoop};
use crate::error::{RelayError, Result};
use crate::gateway::{Gateway, GatewayConfig};
use crate::processor::Processor;

/// Default address of the upgrade endpoint.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Full consumer configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: String,
    pub gateway: GatewayConfig,
    pub dispatch: DispatchConfig,
    pub multiplexer: MultiplexerConfig,
    /// Raise the open-file soft limit before binding. Failure is fatal.
    pub raise_fd_limit: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            gateway: GatewayConfig::default(),
            dispatch: DispatchConfig::default(),
            multiplexer: MultiplexerConfig::default(),
            raise_fd_limit: true,
        }
    }
}

/// Consumer: upgrade gateway, readiness multiplexer and dispatch loop wired
/// around one shared registry.
#[derive(Debug)]
pub struct RelayServer {
    gateway: Gateway,
    dispatch: DispatchLoop,
    mux: Arc<Multiplexer>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Check startup preconditions, create the multiplexer, and bind.
    pub fn bind(config: RelayConfig, processor: Arc<dyn Processor>) -> Result<Self> {
        if config.raise_fd_limit {
            raise_nofile_limit()?;
        }

        let running = Arc::new(AtomicBool::new(true));
        let mux = Arc::new(Multiplexer::with_config(config.multiplexer)?);
        let gateway = Gateway::bind(
            &config.listen,
            Arc::clone(&mux),
            config.gateway,
            Arc::clone(&running),
        )?;
        let local_addr = gateway.local_addr()?;
        let dispatch = DispatchLoop::new(
            Arc::clone(&mux),
            processor,
            config.dispatch,
            Arc::clone(&running),
        )?;

        Ok(Self {
            gateway,
            dispatch,
            mux,
            running,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag shared by every loop of this server; clear it to stop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Serve on the calling thread until the shutdown flag clears.
    ///
    /// The gateway runs on its own thread; dispatch runs here. Registered
    /// connections are closed on the way out.
    pub fn run(self) -> Result<()> {
        let Self {
            gateway,
            dispatch,
            mux,
            running,
            local_addr,
        } = self;
        info!(addr = %local_addr, "relay server running");

        let accept = thread::Builder::new()
            .name("sockrelay-gateway".to_string())
            .spawn(move || gateway.run())
            .map_err(|source| RelayError::Thread {
                name: "gateway",
                source,
            })?;

        let outcome = dispatch.run();
        running.store(false, Ordering::Release);
        if accept.join().is_err() {
            error!("gateway thread panicked");
        }

        let remaining = mux.registry().drain();
        for conn in &remaining {
            conn.close();
        }
        info!(closed = remaining.len(), "relay server stopped");
        outcome
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> Result<RelayHandle> {
        let addr = self.local_addr;
        let running = self.shutdown_flag();
        let mux = Arc::clone(&self.mux);
        let thread = thread::Builder::new()
            .name("sockrelay-dispatch".to_string())
            .spawn(move || self.run())
            .map_err(|source| RelayError::Thread {
                name: "dispatch",
                source,
            })?;
        Ok(RelayHandle {
            addr,
            running,
            mux,
            thread,
        })
    }
}

/// Handle to a server running on a background thread.
#[derive(Debug)]
pub struct RelayHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    mux: Arc<Multiplexer>,
    thread: JoinHandle<Result<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.mux.len()
    }

    /// Stop the server and wait for it to finish.
    pub fn shutdown(self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        match self.thread.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("relay server thread panicked");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    use sockrelay_frame::{decode_result, encode_packet, Frame, FrameKind, Outcome, WorkPacket};
    use sockrelay_transport::{dial, Connection};

    use super::*;
    use crate::error::ProcessingError;
    use crate::processor::default_output_path;

    fn test_server(processor: Arc<dyn Processor>) -> RelayHandle {
        let config = RelayConfig {
            listen: "127.0.0.1:0".to_string(),
            dispatch: DispatchConfig {
                workers: 2,
                queue_capacity: 8,
                wait_timeout: Duration::from_millis(50),
            },
            raise_fd_limit: false,
            ..RelayConfig::default()
        };
        RelayServer::bind(config, processor)
            .expect("server should bind")
            .spawn()
            .expect("server should start")
    }

    fn client(handle: &RelayHandle) -> Connection {
        let conn = dial(
            &format!("ws://{}/websocket", handle.local_addr()),
            Duration::from_secs(2),
        )
        .expect("dial should succeed");
        conn.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout should apply");
        conn
    }

    fn request(conn: &Connection, path: &str) -> sockrelay_frame::JobResult {
        let frame = encode_packet(&WorkPacket::new(path), FrameKind::Text).expect("encode");
        conn.send(frame.into_message().expect("text frame"))
            .expect("send should succeed");
        let reply = conn
            .read_message()
            .expect("read should succeed")
            .expect("result should arrive");
        decode_result(&Frame::from_message(reply).expect("data frame")).expect("decode")
    }

    #[test]
    fn end_to_end_with_stub_processor() {
        let stub = |source: &Path| -> std::result::Result<PathBuf, ProcessingError> {
            Ok(default_output_path(source))
        };
        let handle = test_server(Arc::new(stub));
        let conn = client(&handle);

        let result = request(&conn, "/tmp/1700000000.mov");
        assert_eq!(result.outcome(), Outcome::Success);
        assert_eq!(result.converted_file_name(), "1700000000.mov.mp4");

        handle.shutdown().expect("server should stop cleanly");
    }

    #[test]
    fn processing_failure_is_reported_in_result() {
        let failing = |_: &Path| -> std::result::Result<PathBuf, ProcessingError> {
            Err(ProcessingError::Failed {
                status: "exit status: 1".to_string(),
                stderr: String::new(),
            })
        };
        let handle = test_server(Arc::new(failing));
        let conn = client(&handle);

        let result = request(&conn, "/tmp/broken.mov");
        assert_eq!(result.outcome(), Outcome::Failure);
        assert_eq!(result.converted, "/tmp/broken.mov.mp4");

        // The connection stays usable after a failed job.
        let again = request(&conn, "/tmp/broken2.mov");
        assert_eq!(again.packet, WorkPacket::new("/tmp/broken2.mov"));

        handle.shutdown().expect("server should stop cleanly");
    }

    #[test]
    fn closed_client_is_deregistered() {
        let stub = |source: &Path| -> std::result::Result<PathBuf, ProcessingError> {
            Ok(default_output_path(source))
        };
        let handle = test_server(Arc::new(stub));
        let conn = client(&handle);

        let deadline = Instant::now() + Duration::from_secs(3);
        while handle.connections() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.connections(), 1);

        conn.close();
        let deadline = Instant::now() + Duration::from_secs(3);
        while handle.connections() != 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.connections(), 0);

        handle.shutdown().expect("server should stop cleanly");
    }
}
