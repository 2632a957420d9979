use std::fmt;
use std::io;

/// Errors returned synchronously by service and connector entry points.
///
/// Transport failures, handshake failures and connect timeouts are never
/// surfaced here; they resolve through the disconnect or failure callback of
/// the operation that initiated them. Stale handles are a silent no-op.
#[derive(Debug)]
pub enum Error {
    /// Socket setup or multiplexer operation failed.
    Io(io::Error),
    /// The service (or connector) has not been started or is stopping.
    NotRunning,
    /// No free session slots available on the selected loop.
    SessionLimitReached,
    /// Same-loop placement was requested from a thread that is not one of
    /// the pool's loop threads.
    NotALoopThread,
    /// The target host/port could not be resolved to a socket address.
    InvalidAddress,
    /// A secure session was requested but no TLS configuration is set.
    TlsNotConfigured,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::NotRunning => write!(f, "service not running"),
            Error::SessionLimitReached => write!(f, "session limit reached"),
            Error::NotALoopThread => write!(f, "calling thread is not a pool loop thread"),
            Error::InvalidAddress => write!(f, "invalid address"),
            Error::TlsNotConfigured => write!(f, "TLS not configured"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
