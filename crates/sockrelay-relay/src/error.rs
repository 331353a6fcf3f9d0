use sockrelay_mux::MuxError;
use sockrelay_transport::TransportError;

/// Failure of the external processing step.
///
/// Never propagated: it is stringified into the result's error detail.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The processing program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The program ran and reported failure.
    #[error("{status}")]
    Failed { status: String, stderr: String },
}

/// Errors that stop the consumer as a whole.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Socket setup failed (bind, descriptor limit).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The readiness multiplexer failed to start or became unusable.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// A service thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        source: std::io::Error,
    },

    /// The worker pool no longer accepts jobs.
    #[error("worker pool is shut down")]
    PoolClosed,
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_processing_displays_status_only() {
        let err = ProcessingError::Failed {
            status: "exit status: 1".to_string(),
            stderr: "Unknown encoder".to_string(),
        };
        assert_eq!(err.to_string(), "exit status: 1");
    }

    #[test]
    fn mux_errors_convert_transparently() {
        let err: RelayError = MuxError::Wait(std::io::Error::from_raw_os_error(9)).into();
        assert!(err.to_string().starts_with("readiness wait failed"));
    }
}
