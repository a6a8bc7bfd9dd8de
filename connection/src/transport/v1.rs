//! Bitcoin v1 protocol transport implementation.
//!
//! Frames are `magic (4) | command (12) | length (4) | checksum (4) | payload`.

use super::{TransportError, MAX_PAYLOAD_SIZE};
use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a bitcoin message header in bytes.
const HEADER_SIZE: usize = 24;
/// Offset in the header where the payload length is stored.
const PAYLOAD_LENGTH_OFFSET: usize = 16;

/// Progress of a frame read.
///
/// Kept across calls so [`AsyncV1TransportReader::read`] stays cancellation
/// safe when raced against a timeout.
#[derive(Debug)]
enum ReadProgress {
    Header {
        header: [u8; HEADER_SIZE],
        filled: usize,
    },
    Payload {
        /// Header and payload, the codec wants the whole frame.
        frame: Vec<u8>,
        filled: usize,
    },
}

impl ReadProgress {
    fn header() -> Self {
        ReadProgress::Header {
            header: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Parses the header fields the reader needs before touching the payload.
fn inspect_header(
    header: &[u8; HEADER_SIZE],
    expected_magic: Magic,
) -> Result<usize, TransportError> {
    let magic = Magic::from_bytes([header[0], header[1], header[2], header[3]]);
    if magic != expected_magic {
        return Err(TransportError::MagicMismatch);
    }

    let mut length = [0u8; 4];
    length.copy_from_slice(&header[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4]);
    let payload_len = u32::from_le_bytes(length) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(TransportError::PayloadTooLarge(payload_len));
    }

    Ok(payload_len)
}

/// Reads exactly `buf.len() - *filled` more bytes, tracking progress in `filled`.
async fn fill<R>(reader: &mut R, buf: &mut [u8], filled: &mut usize) -> Result<(), io::Error>
where
    R: AsyncRead + Unpin + Send,
{
    while *filled < buf.len() {
        let n = reader.read(&mut buf[*filled..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        *filled += n;
    }
    Ok(())
}

/// Implements the writer half of the bitcoin v1 protocol transport.
#[derive(Debug)]
pub struct AsyncV1TransportWriter<W> {
    network_magic: Magic,
    writer: W,
}

impl<W> AsyncV1TransportWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(network_magic: Magic, writer: W) -> Self {
        Self {
            network_magic,
            writer,
        }
    }

    /// Serialize, frame and flush a bitcoin network message.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), TransportError> {
        let raw = RawNetworkMessage::new(self.network_magic, message);
        let data = encode::serialize(&raw);

        self.writer.write_all(&data).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Implements the reader half of the bitcoin v1 protocol transport.
#[derive(Debug)]
pub struct AsyncV1TransportReader<R> {
    network_magic: Magic,
    progress: ReadProgress,
    reader: R,
}

impl<R> AsyncV1TransportReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(network_magic: Magic, reader: R) -> Self {
        Self {
            network_magic,
            progress: ReadProgress::header(),
            reader,
        }
    }

    /// Read the next bitcoin network message.
    ///
    /// Cancellation safe: a read interrupted by `tokio::select!` or a timeout
    /// resumes where it stopped on the next call.
    pub async fn read(&mut self) -> Result<NetworkMessage, TransportError> {
        loop {
            match &mut self.progress {
                ReadProgress::Header { header, filled } => {
                    fill(&mut self.reader, header, filled).await?;
                    let header = *header;
                    // A bad header poisons the stream, reset so the error is not sticky
                    // for callers who choose to keep reading.
                    self.progress = ReadProgress::header();
                    let payload_len = inspect_header(&header, self.network_magic)?;

                    let mut frame = Vec::with_capacity(HEADER_SIZE + payload_len);
                    frame.extend_from_slice(&header);
                    frame.resize(HEADER_SIZE + payload_len, 0);
                    self.progress = ReadProgress::Payload {
                        frame,
                        filled: HEADER_SIZE,
                    };
                }
                ReadProgress::Payload { frame, filled } => {
                    fill(&mut self.reader, frame, filled).await?;
                    let raw: Result<RawNetworkMessage, _> = encode::deserialize(frame);
                    self.progress = ReadProgress::header();
                    return Ok(raw?.payload().clone());
                }
            }
        }
    }
}

/// Implements the bitcoin v1 protocol transport over any async reader and writer.
///
/// # Example
///
/// ```rust
/// use bitcoin::p2p::Magic;
/// use bitcoin::p2p::message::NetworkMessage;
/// use bitcoin_seeder_connection::AsyncV1Transport;
/// use tokio::net::TcpStream;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = TcpStream::connect("127.0.0.1:8333").await?;
/// let (reader, writer) = stream.into_split();
///
/// let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, writer);
/// transport.write(NetworkMessage::Ping(42)).await?;
/// let response = transport.read().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AsyncV1Transport<R, W> {
    writer: AsyncV1TransportWriter<W>,
    reader: AsyncV1TransportReader<R>,
}

impl<R, W> AsyncV1Transport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(network_magic: Magic, reader: R, writer: W) -> Self {
        Self {
            writer: AsyncV1TransportWriter::new(network_magic, writer),
            reader: AsyncV1TransportReader::new(network_magic, reader),
        }
    }

    /// Read a bitcoin network message, see [`AsyncV1TransportReader::read`].
    pub async fn read(&mut self) -> Result<NetworkMessage, TransportError> {
        self.reader.read().await
    }

    /// Write a bitcoin network message.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), TransportError> {
        self.writer.write(message).await
    }

    /// Split this transport into separate reader and writer halves.
    pub fn into_split(self) -> (AsyncV1TransportReader<R>, AsyncV1TransportWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder as MockIoBuilder;

    fn frame(network_magic: Magic, payload: NetworkMessage) -> Vec<u8> {
        encode::serialize(&RawNetworkMessage::new(network_magic, payload))
    }

    #[tokio::test]
    async fn test_read_message() {
        let bytes = frame(Magic::BITCOIN, NetworkMessage::Ping(42));
        let reader = MockIoBuilder::new().read(&bytes).build();
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, Vec::new());

        match transport.read().await.unwrap() {
            NetworkMessage::Ping(nonce) => assert_eq!(nonce, 42),
            other => panic!("Expected Ping message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_message() {
        let reader = MockIoBuilder::new().build();
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, Vec::new());

        transport.write(NetworkMessage::Verack).await.unwrap();

        let (_, writer) = transport.into_split();
        assert_eq!(writer.writer, frame(Magic::BITCOIN, NetworkMessage::Verack));
    }

    #[tokio::test]
    async fn test_magic_mismatch_rejected_before_payload() {
        let mut bytes = frame(Magic::TESTNET4, NetworkMessage::Ping(42));
        // Only the header is available, the reader must not wait for the payload.
        bytes.truncate(HEADER_SIZE);
        let reader = MockIoBuilder::new().read(&bytes).build();
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, Vec::new());

        assert!(matches!(
            transport.read().await,
            Err(TransportError::MagicMismatch)
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&Magic::BITCOIN.to_bytes());
        header[4..8].copy_from_slice(b"addr");
        let huge = (MAX_PAYLOAD_SIZE as u32) + 1;
        header[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4]
            .copy_from_slice(&huge.to_le_bytes());
        let reader = MockIoBuilder::new().read(&header).build();
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, Vec::new());

        assert!(matches!(
            transport.read().await,
            Err(TransportError::PayloadTooLarge(len)) if len == huge as usize
        ));
    }

    #[tokio::test]
    async fn test_corrupt_checksum() {
        let mut bytes = frame(Magic::BITCOIN, NetworkMessage::Ping(42));
        // Flip a payload byte so the checksum no longer matches.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let reader = MockIoBuilder::new().read(&bytes).build();
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, Vec::new());

        assert!(matches!(
            transport.read().await,
            Err(TransportError::Deserialize(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_payload() {
        let mut bytes = frame(Magic::BITCOIN, NetworkMessage::Ping(42));
        bytes.truncate(HEADER_SIZE + 2);
        let reader = MockIoBuilder::new().read(&bytes).build();
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, Vec::new());

        assert!(matches!(transport.read().await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_byte_at_a_time() {
        let bytes = frame(Magic::BITCOIN, NetworkMessage::Pong(7));
        let mut builder = MockIoBuilder::new();
        for byte in bytes.chunks(1) {
            builder.read(byte);
        }
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, builder.build(), Vec::new());

        match transport.read().await.unwrap() {
            NetworkMessage::Pong(nonce) => assert_eq!(nonce, 7),
            other => panic!("Expected Pong message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_back_to_back_messages() {
        let mut bytes = frame(Magic::BITCOIN, NetworkMessage::Verack);
        bytes.extend(frame(Magic::BITCOIN, NetworkMessage::GetAddr));
        let reader = MockIoBuilder::new().read(&bytes).build();
        let mut transport = AsyncV1Transport::new(Magic::BITCOIN, reader, Vec::new());

        assert!(matches!(
            transport.read().await.unwrap(),
            NetworkMessage::Verack
        ));
        assert!(matches!(
            transport.read().await.unwrap(),
            NetworkMessage::GetAddr
        ));
    }
}
