//! A bitcoin DNS seeder.
//!
//! The seeder crawls the bitcoin p2p network, remembers which peers answered,
//! and serves a random sample of good peers as DNS A records.
//!
//! * [`registry`] owns all peer state behind a single writer task.
//! * [`worker`] runs one handshake-and-getaddr cycle against one peer.
//! * [`scheduler`] keeps a bounded pool of workers busy and feeds results back.
//! * [`dns`] answers A queries from registry samples.
//! * [`events`] carries structured events to whatever logs them.

mod builder;
mod connection;
pub mod dns;
mod error;
pub mod events;
pub mod registry;
pub mod scheduler;
mod seeder;
pub mod shutdown;
pub mod worker;

pub use builder::{default_port, SeederBuilder, SeederBuilderError, SeederConfig};
pub use connection::{Connector, PeerConnection, TcpConnector};
pub use error::SeederError;
pub use seeder::Seeder;

// Re-exports.
pub use bitcoin_seeder_connection::{
    AdvertisedPeer, ConnectionConfiguration, ConnectionError, UserAgent, UserAgentError,
};
