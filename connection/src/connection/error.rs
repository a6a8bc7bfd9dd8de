//! Error types for connection handling.

use crate::transport::TransportError;
use std::error::Error;
use std::fmt;
use std::io;

/// Errors that can occur during peer connection establishment and communication.
#[derive(Debug)]
pub enum ConnectionError {
    /// An I/O error occurred during network operations, including connect timeouts.
    Io(io::Error),
    /// The transport layer (framing and serialization) failed.
    TransportFailed(TransportError),
}

impl ConnectionError {
    /// True if the error is a malformed or foreign message rather than a
    /// network failure.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            ConnectionError::TransportFailed(TransportError::Io(_)) => false,
            ConnectionError::TransportFailed(_) => true,
            ConnectionError::Io(_) => false,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(err) => write!(f, "Connection error: {err}"),
            ConnectionError::TransportFailed(err) => {
                write!(f, "Transport layer failed in peer connection: {err}")
            }
        }
    }
}

impl Error for ConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnectionError::Io(err) => Some(err),
            ConnectionError::TransportFailed(err) => Some(err),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io(err)
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        ConnectionError::TransportFailed(err)
    }
}
