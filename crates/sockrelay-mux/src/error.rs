use std::os::fd::RawFd;

/// Why a descriptor could not be registered.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationFailure {
    /// The OS refused the registration (e.g. descriptor limit reached).
    #[error("{0}")]
    Os(std::io::Error),

    /// The configured connection ceiling is reached.
    #[error("connection limit of {max} reached")]
    CapacityReached { max: usize },

    /// The descriptor is already registered.
    #[error("descriptor already registered")]
    Duplicate,
}

/// Errors raised by the readiness multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The readiness facility could not be created.
    #[error("failed to create readiness facility: {0}")]
    Init(std::io::Error),

    /// A connection could not be registered.
    #[error("failed to register fd {fd}: {reason}")]
    Registration {
        fd: RawFd,
        reason: RegistrationFailure,
    },

    /// The OS deregistration call failed. The registry entry is gone regardless.
    #[error("failed to deregister fd {fd}: {source}")]
    Deregistration { fd: RawFd, source: std::io::Error },

    /// Waiting for readiness failed.
    #[error("readiness wait failed: {0}")]
    Wait(std::io::Error),
}

impl MuxError {
    /// Whether the multiplexer itself is unusable and the wait loop must stop.
    ///
    /// Only a `Wait` error whose errno says the epoll descriptor or the event
    /// buffer is invalid is fatal; everything else is transient.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Wait(err) => matches!(
                err.raw_os_error(),
                Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::EFAULT)
            ),
            Self::Init(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
