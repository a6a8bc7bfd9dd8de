//! Helpers for building the bitcoin version handshake.
//!
//! The handshake state machine itself belongs to the caller, these functions
//! only produce the values that go on the wire.

use super::configuration::ConnectionConfiguration;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Gets the current Unix timestamp (seconds since January 1, 1970 00:00:00 UTC).
///
/// A clock set before the epoch reads as zero.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Generates a 64-bit nonce for use in version messages.
///
/// Not cryptographically secure, only needs to be unique enough for the
/// protocol's connection loop detection. Many handshakes run concurrently,
/// so a process wide counter is mixed in with the clock and process id.
pub fn generate_nonce() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);
    let pid = process::id() as u64;
    let sequence = COUNTER.fetch_add(1, Ordering::Relaxed);

    now ^ pid.rotate_left(32) ^ sequence.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Builds our version message for a handshake with `receiver`.
pub fn version_message(
    configuration: &ConnectionConfiguration,
    receiver: SocketAddr,
    nonce: u64,
) -> NetworkMessage {
    NetworkMessage::Version(VersionMessage {
        version: configuration.protocol_version,
        services: configuration.services,
        timestamp: unix_timestamp(),
        receiver: Address::new(&receiver, ServiceFlags::NONE),
        sender: Address::new(&configuration.sender_address, configuration.services),
        nonce,
        user_agent: configuration.user_agent.as_str().to_string(),
        start_height: configuration.start_height,
        relay: configuration.relay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_nonces_are_distinct() {
        let nonces: HashSet<u64> = (0..1000).map(|_| generate_nonce()).collect();
        assert_eq!(nonces.len(), 1000);
    }

    #[test]
    fn test_version_message_fields() {
        let config = ConnectionConfiguration::non_listening(70016, None);
        let receiver: SocketAddr = "203.0.113.7:8333".parse().unwrap();

        match version_message(&config, receiver, 99) {
            NetworkMessage::Version(version) => {
                assert_eq!(version.version, 70016);
                assert_eq!(version.nonce, 99);
                assert_eq!(version.receiver.socket_addr().unwrap(), receiver);
                assert_eq!(version.user_agent, config.user_agent.as_str());
                assert!(!version.relay);
                assert!(version.timestamp > 0);
            }
            other => panic!("Expected Version message, got {other:?}"),
        }
    }
}
