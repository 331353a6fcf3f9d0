use tracing::info;

use crate::error::{Result, TransportError};

/// Open-file limits before and after raising them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdLimit {
    /// Soft limit found at startup.
    pub previous: u64,
    /// Soft limit now in effect.
    pub current: u64,
    /// Hard limit (ceiling for the soft limit).
    pub max: u64,
}

/// Read the current `RLIMIT_NOFILE` as `(soft, hard)`.
pub fn nofile_limit() -> Result<(u64, u64)> {
    let limit = get_rlimit()?;
    Ok((limit.rlim_cur as u64, limit.rlim_max as u64))
}

/// Raise the soft open-file limit to the hard limit.
///
/// Every accepted connection holds a descriptor, so the consumer must call
/// this before binding its upgrade endpoint.
pub fn raise_nofile_limit() -> Result<FdLimit> {
    let mut limit = get_rlimit()?;
    let previous = limit.rlim_cur as u64;

    limit.rlim_cur = target_soft_limit(limit.rlim_max);

    // SAFETY: `limit` is a fully initialized rlimit struct and RLIMIT_NOFILE is a
    // valid resource identifier.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    if rc != 0 {
        return Err(TransportError::Limit(std::io::Error::last_os_error()));
    }

    let raised = FdLimit {
        previous,
        current: limit.rlim_cur as u64,
        max: limit.rlim_max as u64,
    };
    info!(
        previous = raised.previous,
        current = raised.current,
        "raised open-file limit"
    );
    Ok(raised)
}

fn get_rlimit() -> Result<libc::rlimit> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid writable rlimit struct for the duration of the call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(TransportError::Limit(std::io::Error::last_os_error()));
    }
    Ok(limit)
}

#[cfg(target_os = "macos")]
fn target_soft_limit(max: libc::rlim_t) -> libc::rlim_t {
    // macOS reports RLIM_INFINITY but rejects soft limits above OPEN_MAX.
    max.min(10240)
}

#[cfg(not(target_os = "macos"))]
fn target_soft_limit(max: libc::rlim_t) -> libc::rlim_t {
    max
}
