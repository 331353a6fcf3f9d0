//! Producer HTTP surface.
//!
//! - `POST /upload`: store a multipart file and queue a work packet for it
//! - `GET /download/{name}`: fetch a stored or converted file
//! - `GET /sse`: stream the base name of every converted file
//! - `GET /index`, `GET /index/{*path}`: static front end

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use sockrelay_frame::WorkPacket;
use sockrelay_link::{LinkError, LinkSender, ResultFanout};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod events;
mod files;
mod upload;

pub use upload::{stored_file_name, UploadError};

/// Default producer HTTP address.
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3500";

/// Largest accepted upload body.
pub const DEFAULT_UPLOAD_LIMIT: usize = 50 << 20;

/// Producer HTTP configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub listen: String,
    /// Where uploads are stored and downloads are served from.
    pub files_dir: PathBuf,
    /// Root of the static front end.
    pub static_dir: PathBuf,
    pub upload_limit: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_HTTP_ADDR.to_string(),
            files_dir: PathBuf::from("files"),
            static_dir: PathBuf::from("static"),
            upload_limit: DEFAULT_UPLOAD_LIMIT,
        }
    }
}

/// Destination for work packets created by uploads.
pub trait PacketSink: Send + Sync + 'static {
    fn submit(&self, packet: WorkPacket) -> Result<(), LinkError>;
}

impl PacketSink for LinkSender {
    fn submit(&self, packet: WorkPacket) -> Result<(), LinkError> {
        self.enqueue(packet)
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<HttpConfig>,
    sink: Arc<dyn PacketSink>,
    fanout: ResultFanout,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: HttpConfig, sink: Arc<dyn PacketSink>, fanout: ResultFanout) -> Self {
        Self {
            config: Arc::new(config),
            sink,
            fanout,
            shutdown: CancellationToken::new(),
        }
    }

    /// End event streams when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

/// Build the producer router.
pub fn router(state: AppState) -> Router {
    let upload_limit = state.config.upload_limit;
    Router::new()
        .route(
            "/upload",
            post(upload::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/download/{name}", get(files::download))
        .route("/sse", get(events::events))
        .route("/index", get(files::index))
        .route("/index/{*path}", get(files::index_path))
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "producer HTTP listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("producer HTTP stopped");
    Ok(())
}
