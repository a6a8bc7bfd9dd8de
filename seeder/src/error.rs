use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Fatal seeder failures.
///
/// Per-peer and per-query problems never surface here, they are absorbed by
/// the component that hit them.
#[derive(Debug)]
pub enum SeederError {
    /// The DNS socket could not be bound.
    DnsBind { address: SocketAddr, error: io::Error },
    /// The seed could not be resolved and there is nothing else to crawl.
    Bootstrap { seed: String, reason: String },
    /// The registry task is gone, nothing can make progress.
    RegistryClosed,
    /// A service task panicked or was cancelled.
    TaskFailed(String),
}

impl fmt::Display for SeederError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeederError::DnsBind { address, error } => {
                write!(f, "Failed to bind DNS socket on {address}: {error}")
            }
            SeederError::Bootstrap { seed, reason } => {
                write!(f, "Bootstrap from {seed} failed with an empty registry: {reason}")
            }
            SeederError::RegistryClosed => write!(f, "Peer registry task is no longer running"),
            SeederError::TaskFailed(reason) => write!(f, "Seeder task failed: {reason}"),
        }
    }
}

impl std::error::Error for SeederError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SeederError::DnsBind { error, .. } => Some(error),
            SeederError::Bootstrap { .. } => None,
            SeederError::RegistryClosed => None,
            SeederError::TaskFailed(_) => None,
        }
    }
}

impl From<tokio::task::JoinError> for SeederError {
    fn from(err: tokio::task::JoinError) -> Self {
        SeederError::TaskFailed(err.to_string())
    }
}
