//! Error handling utils.
//!
//! Syscall-level failures are reported as [`std::io::Error`] values with the
//! raw OS error preserved, so callers can still match on `errno` the way they
//! would against the C library. A blocking call that runs out of time fails
//! with raw OS error `EINTR`, exactly like a call interrupted by a signal.
//! Everything above the syscall layer is wrapped in [`Error`].

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `getaddrinfo(3)` / `getnameinfo(3)` failure other than `EAI_SYSTEM`.
    #[error("failed to resolve address: {message} (code {code})")]
    AddrResolve { code: i32, message: String },
}

/// Builds an [`io::Error`] carrying `EINTR`, the error a blocking call
/// reports when its timeout expires.
#[inline]
pub(crate) fn timed_out() -> io::Error {
    io::Error::from_raw_os_error(libc::EINTR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_eintr() {
        assert_eq!(timed_out().raw_os_error(), Some(libc::EINTR));
        assert_eq!(timed_out().kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn io_error_is_wrapped() {
        let err: Error = io::Error::from_raw_os_error(libc::ECONNREFUSED).into();
        match err {
            Error::IO(inner) => {
                assert_eq!(inner.raw_os_error(), Some(libc::ECONNREFUSED));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
