//! Plaintext bitcoin p2p connections.
//!
//! This crate is the wire boundary of the seeder. It frames and parses bitcoin
//! messages with the `bitcoin` crate's consensus codec and exposes a small
//! `send`/`receive` connection API. Protocol decisions, like how a handshake
//! progresses, are left to the caller.

mod connection;
mod peer;
mod transport;
pub mod user_agent;

pub use connection::{
    generate_nonce, tcp, unix_timestamp, version_message, Connection, ConnectionConfiguration,
    ConnectionError, TcpConnection, DEFAULT_CONNECTION_TIMEOUT,
};
pub use peer::{
    AdvertisedPeer, ADDRV2_MIN_PROTOCOL_VERSION, DEFAULT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};
pub use transport::{
    AsyncV1Transport, AsyncV1TransportReader, AsyncV1TransportWriter, TransportError,
    MAX_PAYLOAD_SIZE,
};
pub use user_agent::{UserAgent, UserAgentError};
