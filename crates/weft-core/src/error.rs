//! Error types for the Weft runtime.

use core::fmt;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by scheduler and backend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A syscall or submitted op failed with the given errno.
    Sys(i32),

    /// A timeout race was won by the timer.
    Timeout,

    /// Write attempted on a pipe whose write end is closed.
    ClosedPipe,

    /// An event already has a waiter.
    AlreadyAwaited,

    /// Out-of-range length, bad option, malformed descriptor.
    Arg(&'static str),

    /// The target fiber terminated before producing a result.
    Terminated,

    /// The fiber panicked; the payload is lost across the stack switch.
    Panicked,

    /// Operation requires a runtime on the current thread.
    NoRuntime,

    /// Suspension attempted outside a fiber.
    OutsideFiber,

    /// Requested backend is unavailable on this system.
    BackendUnavailable(&'static str),
}

impl Error {
    /// Build a `Sys` error from a negative op result.
    #[inline]
    pub fn from_neg(result: i32) -> Self {
        Error::Sys(-result)
    }

    /// Build a `Sys` error from the calling thread's errno.
    pub fn last_os_error() -> Self {
        Error::Sys(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    #[inline]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Sys(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Sys(e) => write!(f, "system error: errno {}", e),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ClosedPipe => write!(f, "pipe is closed for writing"),
            Error::AlreadyAwaited => write!(f, "event is already awaited by another fiber"),
            Error::Arg(msg) => write!(f, "invalid argument: {}", msg),
            Error::Terminated => write!(f, "fiber terminated"),
            Error::Panicked => write!(f, "fiber panicked"),
            Error::NoRuntime => write!(f, "no runtime on this thread"),
            Error::OutsideFiber => write!(f, "operation requires a fiber context"),
            Error::BackendUnavailable(kind) => write!(f, "backend unavailable: {}", kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Sys(e.raw_os_error().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::Timeout), "operation timed out");
        assert_eq!(format!("{}", Error::Sys(32)), "system error: errno 32");
    }

    #[test]
    fn test_from_neg() {
        assert_eq!(Error::from_neg(-11), Error::Sys(11));
        assert_eq!(Error::Sys(11).errno(), Some(11));
        assert_eq!(Error::Timeout.errno(), None);
    }
}
