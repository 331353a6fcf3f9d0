use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sockrelay_mux::{Multiplexer, MuxError};
use sockrelay_transport::{
    bind, upgrade, Connection, TransportError, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_UPGRADE_PATH,
};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Default interval at which the accept loop re-checks the shutdown flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upgrade gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Request path that accepts upgrades; anything else gets 404.
    pub path: String,
    /// Bound on one handshake.
    pub handshake_timeout: Duration,
    /// Sleep between accept attempts while idle.
    pub poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_UPGRADE_PATH.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Accepts TCP connections, upgrades them, and registers them for dispatch.
pub struct Gateway {
    listener: TcpListener,
    mux: Arc<Multiplexer>,
    config: GatewayConfig,
    running: Arc<AtomicBool>,
}

impl Gateway {
    /// Bind the upgrade endpoint.
    pub fn bind(
        addr: &str,
        mux: Arc<Multiplexer>,
        config: GatewayConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = bind(addr)?;
        listener.set_nonblocking(true).map_err(TransportError::from)?;
        Ok(Self {
            listener,
            mux,
            config,
            running,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|err| RelayError::Transport(err.into()))
    }

    /// Accept until the shutdown flag clears.
    ///
    /// Each handshake runs on its own short-lived thread so one slow client
    /// cannot stall the accept loop.
    pub fn run(&self) {
        info!(path = %self.config.path, "gateway accepting");
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_upgrade(stream, peer),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.config.poll_interval);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    // EMFILE and friends: back off and let descriptors free up.
                    warn!(error = %err, "accept failed");
                    thread::sleep(self.config.poll_interval);
                }
            }
        }
        info!("gateway stopped");
    }

    fn spawn_upgrade(&self, stream: TcpStream, peer: SocketAddr) {
        let mux = Arc::clone(&self.mux);
        let path = self.config.path.clone();
        let timeout = self.config.handshake_timeout;

        let spawned = thread::Builder::new()
            .name("sockrelay-upgrade".to_string())
            .spawn(move || match upgrade(stream, &path, timeout) {
                Ok(conn) => {
                    let _ = register(&mux, Arc::new(conn));
                }
                Err(err) => debug!(%peer, error = %err, "upgrade failed"),
            });
        if let Err(err) = spawned {
            warn!(%peer, error = %err, "failed to spawn upgrade thread");
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("addr", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish()
    }
}

/// Register an upgraded connection, closing it when registration fails.
pub fn register(mux: &Multiplexer, conn: Arc<Connection>) -> std::result::Result<(), MuxError> {
    match mux.add(Arc::clone(&conn)) {
        Ok(()) => {
            debug!(conn_id = conn.id(), fd = conn.fd(), peer = ?conn.peer_addr(), "connection registered");
            Ok(())
        }
        Err(err) => {
            warn!(conn_id = conn.id(), error = %err, "failed to register connection");
            conn.close();
            Err(err)
        }
    }
}
