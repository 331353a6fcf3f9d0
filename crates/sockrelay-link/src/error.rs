use sockrelay_frame::FrameError;
use sockrelay_transport::TransportError;

/// Errors raised by the producer link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Dialing the consumer failed.
    #[error("failed to dial consumer: {0}")]
    Dial(TransportError),

    /// The active connection is severed (reset, broken pipe, closed).
    #[error("link broken: {0}")]
    Broken(TransportError),

    /// The outbound queue is at capacity. Retry later.
    #[error("outbound queue full ({capacity} packets pending)")]
    QueueFull { capacity: usize },

    /// The link has shut down and accepts no more packets.
    #[error("link closed")]
    Closed,

    /// A packet or result could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A write failed for a reason other than a severed link.
    #[error("websocket write failed: {0}")]
    WebSocket(TransportError),

    /// A link thread could not be spawned.
    #[error("failed to spawn link thread: {0}")]
    Thread(std::io::Error),
}

impl LinkError {
    /// Classify a write error from the active connection.
    pub fn from_write(err: TransportError) -> Self {
        if err.is_link_broken() {
            Self::Broken(err)
        } else {
            Self::WebSocket(err)
        }
    }

    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use std::io::{Error, ErrorKind};

    use super::*;

    #[test]
    fn write_errors_are_classified() {
        let reset = LinkError::from_write(TransportError::Io(Error::from(ErrorKind::ConnectionReset)));
        assert!(matches!(reset, LinkError::Broken(_)));

        let pipe = LinkError::from_write(TransportError::Io(Error::from(ErrorKind::BrokenPipe)));
        assert!(matches!(pipe, LinkError::Broken(_)));

        let timeout = LinkError::from_write(TransportError::Io(Error::from(ErrorKind::TimedOut)));
        assert!(matches!(timeout, LinkError::WebSocket(_)));
    }

    #[test]
    fn only_queue_full_is_retryable() {
        assert!(LinkError::QueueFull { capacity: 4 }.is_retryable());
        assert!(!LinkError::Closed.is_retryable());
        assert_eq!(
            LinkError::QueueFull { capacity: 4 }.to_string(),
            "outbound queue full (4 packets pending)"
        );
    }
}
