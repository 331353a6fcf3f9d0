use std::io::ErrorKind;
use std::net::SocketAddr;

use tungstenite::error::ProtocolError;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to open a TCP connection to the specified endpoint.
    #[error("failed to connect to {url}: {source}")]
    Connect { url: String, source: std::io::Error },

    /// The endpoint URL cannot be dialed.
    #[error("invalid endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The WebSocket handshake did not complete.
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// The upgrade request targeted a path with no endpoint behind it.
    #[error("upgrade rejected for path {path}")]
    Rejected { path: String },

    /// An I/O error occurred on the underlying socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A WebSocket protocol error occurred.
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// Adjusting the process resource limit failed.
    #[error("failed to raise open-file limit: {0}")]
    Limit(std::io::Error),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => Self::Io(io),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::WebSocket(Box::new(other)),
        }
    }
}

impl TransportError {
    /// Whether this error means the connection is severed and must be redialed.
    pub fn is_link_broken(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(err) => matches!(
                err.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            Self::WebSocket(err) => matches!(
                err.as_ref(),
                tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
                    | tungstenite::Error::Protocol(ProtocolError::SendAfterClosing)
            ),
            _ => false,
        }
    }

    /// Whether this error is a read or write timeout on a blocking socket.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
    }

    pub(crate) fn handshake(peer: Option<SocketAddr>, reason: impl Into<String>) -> Self {
        Self::Handshake {
            peer: peer.map_or_else(|| "unknown".to_string(), |addr| addr.to_string()),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
