//! Error handling utils.
//!
//! Every fallible operation of the runtime reports failure as an ordinary
//! [`Result`] carrying one of the cases below; errors never cross the
//! scheduler by unwinding. Kernel errors from the I/O layer pass through
//! unmodified as [`Error::Io`].

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The fiber was interrupted with [`Fiber::interrupt`] while blocked (or
    /// before its next blocking call).
    ///
    /// [`Fiber::interrupt`]: crate::fiber::Fiber::interrupt
    #[error("interrupted by another fiber")]
    Interrupted,

    /// The deadline elapsed before the awaited condition held.
    #[error("operation timed out")]
    TimedOut,

    /// The current fiber attempted to re-acquire a mutex it already owns.
    #[error("resource deadlock would occur")]
    Deadlock,

    /// The current fiber tried to unlock a mutex it does not own.
    #[error("current fiber does not own the mutex")]
    NotOwner,

    /// The resource still has outstanding users.
    #[error("resource is busy")]
    Busy,

    /// Illegal argument or state.
    #[error("invalid argument")]
    Invalid,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The last kernel error, captured from `errno`.
    pub(crate) fn last_os() -> Self {
        Error::Io(io::Error::last_os_error())
    }

    pub(crate) fn from_raw_os(code: i32) -> Self {
        Error::Io(io::Error::from_raw_os_error(code))
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(e) => e,
            Error::Interrupted => io::ErrorKind::Interrupted.into(),
            Error::TimedOut => io::ErrorKind::TimedOut.into(),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
