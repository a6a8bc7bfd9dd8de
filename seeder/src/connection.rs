//! Peer connection abstractions.
//!
//! The [`PeerConnection`] and [`Connector`] traits sit between the crawl
//! worker and the network so the worker's state machine can be driven by
//! scripted connections in tests.

use bitcoin::p2p::message::NetworkMessage;
use bitcoin::Network;
use bitcoin_seeder_connection::{tcp, Connection, ConnectionError, DEFAULT_CONNECTION_TIMEOUT};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// A message stream to one bitcoin peer.
pub trait PeerConnection: Send {
    fn send(
        &mut self,
        message: NetworkMessage,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Must be cancellation safe, the worker wraps every read in a timeout.
    fn receive(&mut self) -> impl Future<Output = Result<NetworkMessage, ConnectionError>> + Send;
}

impl<R, W> PeerConnection for Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn send(
        &mut self,
        message: NetworkMessage,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        Connection::send(self, message)
    }

    fn receive(&mut self) -> impl Future<Output = Result<NetworkMessage, ConnectionError>> + Send {
        Connection::receive(self)
    }
}

/// Factory for peer connections.
pub trait Connector: Clone + Send + Sync + 'static {
    type Connection: PeerConnection + Send + 'static;

    /// Opens a connection to `address`. No messages are exchanged yet.
    fn connect(
        &self,
        address: SocketAddr,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

/// Opens plaintext TCP connections on a given network.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    network: Network,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type Connection = tcp::TcpConnection;

    fn connect(
        &self,
        address: SocketAddr,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send {
        tcp::connect(address, self.network, self.connect_timeout)
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::{MockConnector, MockPeerConnection};
    use super::*;

    #[tokio::test]
    async fn test_mock_connector_scripts_per_address() {
        let known: SocketAddr = "10.0.0.1:8333".parse().unwrap();
        let unknown: SocketAddr = "10.0.0.2:8333".parse().unwrap();
        let connector = MockConnector::new();
        let mut script = MockPeerConnection::new();
        script.add_incoming_message(NetworkMessage::Verack);
        connector.add_connection(known, script);

        let mut connection = connector.connect(known).await.unwrap();
        assert!(matches!(
            connection.receive().await.unwrap(),
            NetworkMessage::Verack
        ));
        assert!(connector.connect(unknown).await.is_err());
        // The script for `known` was consumed.
        assert!(connector.connect(known).await.is_err());
        assert_eq!(connector.attempts(), vec![known, unknown, known]);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let connector =
            TcpConnector::new(Network::Regtest).with_connect_timeout(Duration::from_secs(2));
        assert!(connector.connect(address).await.is_err());
    }
}
