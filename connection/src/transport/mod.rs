//! Bitcoin protocol transport.
//!
//! Only the v1 plaintext protocol is implemented. Message serialization is
//! delegated to the `bitcoin` crate, this layer owns framing, network magic
//! checks and bounds on payload size.

mod v1;

pub use v1::{AsyncV1Transport, AsyncV1TransportReader, AsyncV1TransportWriter};

use bitcoin::consensus::encode;
use std::fmt;
use std::io;

/// Largest payload accepted from a peer, matching Bitcoin Core's
/// `MAX_PROTOCOL_MESSAGE_LENGTH`.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1000 * 1000;

/// Error types specific to the transport layer.
#[derive(Debug)]
pub enum TransportError {
    /// IO error during read/write operations.
    Io(io::Error),
    /// Failed to deserialize a message, including checksum failures.
    Deserialize(encode::Error),
    /// Network magic in the message doesn't match the expected value.
    MagicMismatch,
    /// The header announced a payload larger than [`MAX_PAYLOAD_SIZE`].
    PayloadTooLarge(usize),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {e}"),
            TransportError::Deserialize(e) => write!(f, "Message deserialization error: {e}"),
            TransportError::MagicMismatch => write!(f, "Network magic mismatch"),
            TransportError::PayloadTooLarge(len) => {
                write!(f, "Payload of {len} bytes exceeds {MAX_PAYLOAD_SIZE}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Deserialize(e) => Some(e),
            TransportError::MagicMismatch => None,
            TransportError::PayloadTooLarge(_) => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<encode::Error> for TransportError {
    fn from(e: encode::Error) -> Self {
        TransportError::Deserialize(e)
    }
}
