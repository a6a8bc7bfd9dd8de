//! Bitcoin p2p protocol connection.
//!
//! A [`Connection`] is an established byte stream to one peer with the v1
//! transport layered on top. It performs no protocol logic of its own: the
//! version handshake, pings and address requests are driven by the caller
//! through [`Connection::send`] and [`Connection::receive`].
//!
//! # Example
//!
//! ```no_run
//! use bitcoin::Network;
//! use bitcoin::p2p::message::NetworkMessage;
//! use bitcoin_seeder_connection::{tcp, version_message, generate_nonce, ConnectionConfiguration};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let peer = "127.0.0.1:8333".parse()?;
//! let mut connection = tcp::connect(peer, Network::Bitcoin, Duration::from_secs(10)).await?;
//!
//! let config = ConnectionConfiguration::default();
//! connection.send(version_message(&config, peer, generate_nonce())).await?;
//! let reply = connection.receive().await?;
//! println!("Received: {}", reply.cmd());
//! # Ok(())
//! # }
//! ```

mod configuration;
mod error;
mod handshake;
pub mod tcp;

pub use configuration::{ConnectionConfiguration, DEFAULT_CONNECTION_TIMEOUT};
pub use error::ConnectionError;
pub use handshake::{generate_nonce, unix_timestamp, version_message};
pub use tcp::TcpConnection;

use crate::transport::AsyncV1Transport;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::Magic;
use log::trace;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A framed message stream to a single bitcoin peer.
///
/// Generic over the byte stream so tests can drive it with in-memory I/O,
/// production code uses the [`TcpConnection`] alias.
#[derive(Debug)]
pub struct Connection<R, W> {
    /// The peer this connection is established with.
    peer: SocketAddr,
    transport: AsyncV1Transport<R, W>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps an already established byte stream.
    pub fn new(peer: SocketAddr, magic: Magic, reader: R, writer: W) -> Self {
        Self {
            peer,
            transport: AsyncV1Transport::new(magic, reader, writer),
        }
    }

    /// The address of the remote peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send a message to the peer.
    pub async fn send(&mut self, message: NetworkMessage) -> Result<(), ConnectionError> {
        trace!("Sending {} to {}", message.cmd(), self.peer);
        self.transport.write(message).await?;
        Ok(())
    }

    /// Receive the next message from the peer.
    ///
    /// Cancellation safe, so it may be wrapped in a timeout and retried.
    pub async fn receive(&mut self) -> Result<NetworkMessage, ConnectionError> {
        let message = self.transport.read().await?;
        trace!("Received {} from {}", message.cmd(), self.peer);
        Ok(message)
    }
}

impl<R, W> fmt::Display for Connection<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v1 connection to {}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::encode;
    use bitcoin::p2p::message::RawNetworkMessage;
    use tokio_test::io::Builder as MockIoBuilder;

    fn frame(message: NetworkMessage) -> Vec<u8> {
        encode::serialize(&RawNetworkMessage::new(Magic::BITCOIN, message))
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let peer: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        let reader = MockIoBuilder::new()
            .read(&frame(NetworkMessage::Ping(456)))
            .build();
        let writer = MockIoBuilder::new()
            .write(&frame(NetworkMessage::Pong(456)))
            .build();
        let mut connection = Connection::new(peer, Magic::BITCOIN, reader, writer);

        match connection.receive().await.unwrap() {
            NetworkMessage::Ping(nonce) => {
                connection.send(NetworkMessage::Pong(nonce)).await.unwrap()
            }
            other => panic!("Expected Ping message, got {other:?}"),
        }
        assert_eq!(connection.peer(), peer);
    }

    #[tokio::test]
    async fn test_transport_error_classification() {
        let peer: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        let foreign = encode::serialize(&RawNetworkMessage::new(
            Magic::SIGNET,
            NetworkMessage::Verack,
        ));
        let reader = MockIoBuilder::new().read(&foreign).build();
        let mut connection = Connection::new(peer, Magic::BITCOIN, reader, Vec::new());

        let err = connection.receive().await.unwrap_err();
        assert!(err.is_protocol_violation());

        let eof = ConnectionError::TransportFailed(crate::TransportError::Io(
            std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
        ));
        assert!(!eof.is_protocol_violation());
    }
}
