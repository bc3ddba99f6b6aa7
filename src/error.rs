use std::fmt;

/// Library-level errors: signature verification, frame encoding, and
/// dispatcher invariant violations. Transport and configuration errors are
/// reported with `anyhow` at the binary layer instead.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    BadSignature,
    BadNamespace(&'static str),
    Compression(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::BadSignature => write!(f, "signature verification failed"),
            Error::BadNamespace(msg) => write!(f, "bad namespace: {msg}"),
            Error::Compression(msg) => write!(f, "compression failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
