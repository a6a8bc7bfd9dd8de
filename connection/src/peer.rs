//! Bitcoin peer addresses as advertised on the wire.

use bitcoin::p2p::address::{AddrV2, AddrV2Message, Address};
use bitcoin::p2p::ServiceFlags;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Minimum protocol version for basic compatibility with modern bitcoin nodes.
///
/// BIP-0031 added the ping nonce, nodes below it are not worth tracking.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;
/// Minimum protocol version that supports AddrV2 messages (BIP155).
///
/// Bitcoin Core implemented this in version 0.21.0 with protocol version 70016.
pub const ADDRV2_MIN_PROTOCOL_VERSION: u32 = 70016;
/// Protocol version advertised when the caller does not pick one.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 70016;

/// A peer address learned from an `addr` or `addrv2` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisedPeer {
    /// The advertised socket address.
    pub address: SocketAddr,
    /// The service flags the advertising node claims for this peer.
    pub services: ServiceFlags,
}

impl AdvertisedPeer {
    /// Converts a legacy `addr` entry.
    ///
    /// Returns `None` for entries that do not carry an IP address, e.g. onion
    /// addresses smuggled through the IPv6 range.
    pub fn from_address(address: &Address) -> Option<Self> {
        let socket = address.socket_addr().ok()?;
        Some(AdvertisedPeer {
            address: normalize(socket),
            services: address.services,
        })
    }

    /// Converts a BIP-155 `addrv2` entry.
    ///
    /// Only IPv4 and IPv6 networks are representable, everything else
    /// (Tor, I2P, CJDNS) returns `None`.
    pub fn from_addr_v2(message: &AddrV2Message) -> Option<Self> {
        let ip = match &message.addr {
            AddrV2::Ipv4(ipv4) => IpAddr::V4(*ipv4),
            AddrV2::Ipv6(ipv6) => IpAddr::V6(*ipv6),
            _ => return None,
        };
        Some(AdvertisedPeer {
            address: normalize(SocketAddr::new(ip, message.port)),
            services: message.services,
        })
    }
}

impl fmt::Display for AdvertisedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (services: {})", self.address, self.services)
    }
}

/// Legacy `addr` messages carry IPv4 as IPv4-mapped IPv6, fold those back.
fn normalize(socket: SocketAddr) -> SocketAddr {
    match socket.ip() {
        IpAddr::V6(ipv6) => match ipv6.to_ipv4_mapped() {
            Some(ipv4) => SocketAddr::new(IpAddr::V4(ipv4), socket.port()),
            None => socket,
        },
        IpAddr::V4(_) => socket,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_from_address_ipv4() {
        let socket = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 8333);
        let address = Address::new(&socket, ServiceFlags::NETWORK);

        let peer = AdvertisedPeer::from_address(&address).unwrap();
        assert_eq!(peer.address, socket);
        assert!(peer.services.has(ServiceFlags::NETWORK));
    }

    #[test]
    fn test_from_addr_v2_skips_non_ip() {
        let onion = AddrV2Message {
            time: 0,
            services: ServiceFlags::NETWORK,
            addr: AddrV2::TorV3([7u8; 32]),
            port: 8333,
        };
        assert!(AdvertisedPeer::from_addr_v2(&onion).is_none());

        let ipv6 = AddrV2Message {
            time: 0,
            services: ServiceFlags::WITNESS,
            addr: AddrV2::Ipv6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            port: 18333,
        };
        let peer = AdvertisedPeer::from_addr_v2(&ipv6).unwrap();
        assert_eq!(peer.address.port(), 18333);
        assert!(peer.address.is_ipv6());
    }

    #[test]
    fn test_normalize_mapped_ipv4() {
        let mapped = SocketAddr::new(
            IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped()),
            8333,
        );
        assert_eq!(
            normalize(mapped),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8333)
        );
    }
}
