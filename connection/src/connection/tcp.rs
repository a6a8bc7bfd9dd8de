//! TCP-specific connections.

use super::{Connection, ConnectionError};
use bitcoin::Network;
use log::debug;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A TCP-based connection to a bitcoin peer.
pub type TcpConnection = Connection<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Establish a TCP connection to a bitcoin peer.
///
/// The connect attempt is bounded by `timeout`. No messages are exchanged,
/// the returned connection is ready for the caller to start a handshake.
pub async fn connect(
    peer: SocketAddr,
    network: Network,
    timeout: Duration,
) -> Result<TcpConnection, ConnectionError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(peer)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ConnectionError::Io(e)),
        Err(_) => {
            return Err(ConnectionError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection attempt timed out",
            )))
        }
    };
    // No delay is helpful for the small packets of the bitcoin p2p protocol.
    stream.set_nodelay(true)?;
    debug!("TCP connection established to {peer}");

    let (reader, writer) = stream.into_split();
    Ok(Connection::new(
        peer,
        network.magic(),
        BufReader::new(reader),
        writer,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::encode;
    use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let bytes = encode::serialize(&RawNetworkMessage::new(
                Network::Regtest.magic(),
                NetworkMessage::Verack,
            ));
            socket.write_all(&bytes).await.unwrap();
        });

        let mut connection = connect(address, Network::Regtest, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(connection.peer(), address);
        assert!(matches!(
            connection.receive().await.unwrap(),
            NetworkMessage::Verack
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port and close it again so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(address, Network::Regtest, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectionError::Io(_))));
    }
}
