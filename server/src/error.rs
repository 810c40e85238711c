use std::fmt;
use std::io;

/// Errors returned by server setup and the event loop.
#[derive(Debug)]
pub enum Error {
    /// Socket or poll operation failed.
    Io(io::Error),
    /// The configured listen address could not be parsed.
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(addr) => write!(f, "invalid listen address: {addr}"),
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
