use std::io;
use std::os::unix::io::RawFd;

use failure::Fail;

use crate::reactor::Event;

/// Errors surfaced by the runtime core.
///
/// Syscall failures keep their errno (see [`Error::IO`] and
/// `io::Error::raw_os_error`); internal invariant violations are
/// [`Error::InvalidState`] and are logged at error level where they are
/// detected.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid state: {}", _0)]
    InvalidState(&'static str),

    #[fail(display = "stop() must run on the scheduler's caller thread")]
    WrongThread,

    #[fail(display = "scheduler is stopped")]
    Stopped,

    #[fail(display = "epoll_ctl: {}", _0)]
    Epoll(io::Error),

    #[fail(display = "event {:?} already registered on fd {}", event, fd)]
    AlreadyRegistered { fd: RawFd, event: Event },

    #[fail(display = "operation timed out")]
    Timeout,

    #[fail(display = "wait was cancelled")]
    Cancelled,

    #[fail(display = "file descriptor is closed")]
    Closed,

    #[fail(display = "IO error: {}", _0)]
    IO(io::Error),

    #[fail(display = "dependency would create a cycle")]
    Cycle,

    #[fail(display = "no load balancer for the requested service")]
    NoService,

    #[fail(display = "no connected backend available")]
    NoConnection,

    #[fail(display = "task failed: {}", _0)]
    TaskFailed(String),
}

impl Error {
    /// The errno equivalent for kinds that cross the hook boundary.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Timeout => Some(libc::ETIMEDOUT),
            Error::Cancelled => Some(libc::ECANCELED),
            Error::Closed => Some(libc::EBADF),
            Error::IO(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IO(error)
    }
}

/// Hooked syscalls report failures as `io::Error` so the libc errno
/// contract survives; kinds without an errno ride along as the payload.
impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        match (error.errno(), error) {
            (Some(errno), _) => io::Error::from_raw_os_error(errno),
            (None, Error::IO(inner)) => inner,
            (None, other) => io::Error::new(io::ErrorKind::Other, other.compat()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_keeps_errno() {
        let err: Error = io::Error::from_raw_os_error(libc::ETIMEDOUT).into();
        match err {
            Error::IO(inner) => assert_eq!(inner.raw_os_error(), Some(libc::ETIMEDOUT)),
            other => panic!("unexpected variant: {}", other),
        }
    }
}
