//! Error taxonomy for throttle control operations.

use thiserror::Error;

/// Errors surfaced by the filter manager and throttle engine.
///
/// Backends report through `anyhow`; these variants are what the engine
/// hands back to callers so they can tell the failure modes apart.
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// The OS refused the operation because we lack the required privilege.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The packet filtering subsystem could not be opened.
    #[error("filtering engine unavailable: {0}")]
    EngineUnavailable(String),

    /// `stop` was called for a pid that has no throttle.
    #[error("PID {0} is not throttled")]
    NotThrottled(u32),

    /// One half of a download/upload filter pair failed and was rolled back.
    #[error("partial filter install for PID {pid} rolled back: {source}")]
    PartialInstall {
        pid: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The session still has installed filters and cannot be closed.
    #[error("filtering session still has {0} installed filter(s)")]
    SessionInUse(usize),

    /// The handle was never issued or has already been removed.
    #[error("unknown filter handle {0}")]
    UnknownHandle(u64),

    /// Any other backend failure.
    #[error("filter backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl ThrottleError {
    /// Classify a backend error, recognising permission failures.
    pub fn from_backend(err: anyhow::Error) -> Self {
        if is_permission_error(&err) {
            ThrottleError::PermissionDenied(format!("{:#}", err))
        } else {
            ThrottleError::Backend(err)
        }
    }
}

/// Walk an error chain looking for an OS permission failure.
pub fn is_permission_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io| {
                io.kind() == std::io::ErrorKind::PermissionDenied
                    || io.raw_os_error() == Some(libc::EPERM)
            })
            .unwrap_or(false)
    })
}

pub type ThrottleResult<T> = std::result::Result<T, ThrottleError>;
