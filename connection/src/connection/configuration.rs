//! Connection configuration types and constants.

use crate::peer::DEFAULT_PROTOCOL_VERSION;
use crate::user_agent::UserAgent;
use bitcoin::p2p::ServiceFlags;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Non-listening address used in version messages.
///
/// Signals to peers that we are not accepting incoming connections
/// and should not be advertised to other nodes.
pub const NON_LISTENING_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0);

/// Default timeout for TCP connection establishment.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// What we tell a peer about ourselves in the version handshake.
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    /// Protocol version we advertise.
    pub protocol_version: u32,
    /// User agent advertised in the version message.
    pub user_agent: UserAgent,
    /// Service flags advertised by this node.
    pub services: ServiceFlags,
    /// Address advertised as the sender in version messages.
    pub sender_address: SocketAddr,
    /// Block height advertised in version messages.
    pub start_height: i32,
    /// Whether the peer should relay transactions to us.
    pub relay: bool,
    /// Whether to send `sendaddrv2` during the handshake (BIP-155).
    pub enable_addrv2: bool,
}

impl ConnectionConfiguration {
    /// Creates a new configuration for a non-listening node.
    ///
    /// Advertises no services, uses a non-listening address, and asks peers
    /// not to relay transactions. Suitable for a crawler which only wants
    /// to query the network.
    ///
    /// # Arguments
    ///
    /// * `protocol_version` - The protocol version to advertise.
    /// * `user_agent` - Optional custom user agent, defaults to the seeder's own.
    pub fn non_listening(protocol_version: u32, user_agent: Option<UserAgent>) -> Self {
        Self {
            protocol_version,
            user_agent: user_agent.unwrap_or_default(),
            services: ServiceFlags::NONE,
            sender_address: NON_LISTENING_ADDRESS,
            start_height: 0,
            relay: false,
            enable_addrv2: true,
        }
    }

    /// Disable or enable BIP-155 `sendaddrv2` negotiation.
    pub fn with_addrv2(mut self, enabled: bool) -> Self {
        self.enable_addrv2 = enabled;
        self
    }
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self::non_listening(DEFAULT_PROTOCOL_VERSION, None)
    }
}

impl fmt::Display for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionConfiguration {{ protocol: {}, user_agent: \"{}\", services: {}, addrv2: {}, relay: {} }}",
            self.protocol_version, self.user_agent, self.services, self.enable_addrv2, self.relay
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_listening_defaults() {
        let config = ConnectionConfiguration::non_listening(70015, None);
        assert_eq!(config.protocol_version, 70015);
        assert_eq!(config.services, ServiceFlags::NONE);
        assert_eq!(config.sender_address, NON_LISTENING_ADDRESS);
        assert!(!config.relay);
        assert!(config.enable_addrv2);
        assert_eq!(config.user_agent, UserAgent::default());
    }

    #[test]
    fn test_custom_user_agent() {
        let agent = UserAgent::new("/scout:2.0/").unwrap();
        let config = ConnectionConfiguration::non_listening(70016, Some(agent.clone()))
            .with_addrv2(false);
        assert_eq!(config.user_agent, agent);
        assert!(!config.enable_addrv2);
    }
}
