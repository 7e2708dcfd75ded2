use std::fmt;
use std::io;

/// Errors returned by the whorl runtime.
#[derive(Debug)]
pub enum Error {
    /// A socket, eventfd, timerfd or poller syscall failed.
    Io(io::Error),
    /// A worker thread exited before its event loop came up.
    WorkerStartup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::WorkerStartup(msg) => write!(f, "worker startup: {msg}"),
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
