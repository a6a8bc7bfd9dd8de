//! Peer records and the filters applied to them.

use bitcoin::p2p::ServiceFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Where a peer stands from the crawler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Known but no crawl has succeeded yet.
    NeverTried,
    /// The last crawl completed a handshake. Only these are served over DNS.
    ConnectedRecently,
    /// Failed often enough in a row to cross the failure threshold.
    Unreachable,
    /// Never crawled and never served.
    Banned,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerStatus::NeverTried => "never-tried",
            PeerStatus::ConnectedRecently => "connected-recently",
            PeerStatus::Unreachable => "unreachable",
            PeerStatus::Banned => "banned",
        };
        f.write_str(name)
    }
}

/// How we first learned about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerSource {
    /// Resolved from the bootstrap DNS seed.
    Seed,
    /// Advertised by another peer in an `addr` or `addrv2` message.
    Gossip,
    /// Configured by the operator. Never replaced by another source.
    Manual,
}

impl fmt::Display for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerSource::Seed => "seed",
            PeerSource::Gossip => "gossip",
            PeerSource::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Everything the registry knows about one peer.
///
/// Values handed out by the registry are copies, changing them has no effect
/// on the registry itself. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: SocketAddr,
    pub status: PeerStatus,
    pub source: PeerSource,
    #[serde(with = "service_bits")]
    pub services: ServiceFlags,
    /// Last time the peer was advertised to us or answered a crawl.
    pub last_seen: Option<u64>,
    pub last_success: Option<u64>,
    pub last_attempt: Option<u64>,
    pub consecutive_failures: u32,
    /// Earliest time the peer may be crawled again. `None` means now.
    pub eligible_at: Option<u64>,
}

impl PeerRecord {
    pub(crate) fn new(address: SocketAddr, source: PeerSource) -> Self {
        PeerRecord {
            address,
            status: PeerStatus::NeverTried,
            source,
            services: ServiceFlags::NONE,
            last_seen: None,
            last_success: None,
            last_attempt: None,
            consecutive_failures: 0,
            eligible_at: None,
        }
    }

    /// True if a crawl may be started at `now`.
    ///
    /// Never tried peers always are, banned peers never.
    pub fn is_eligible(&self, now: u64) -> bool {
        match self.status {
            PeerStatus::Banned => false,
            PeerStatus::NeverTried => true,
            _ => self.eligible_at.map_or(true, |at| at <= now),
        }
    }
}

/// Restricts which records a sample may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFilter {
    /// Every one of these bits must be advertised by the peer.
    pub required_services: ServiceFlags,
    /// Only IPv4 peers, which is all an A record can carry.
    pub ipv4_only: bool,
}

impl PeerFilter {
    /// Matches every record.
    pub fn any() -> Self {
        PeerFilter {
            required_services: ServiceFlags::NONE,
            ipv4_only: false,
        }
    }

    /// Matches IPv4 records.
    pub fn ipv4() -> Self {
        PeerFilter {
            ipv4_only: true,
            ..Self::any()
        }
    }

    pub fn with_services(mut self, services: ServiceFlags) -> Self {
        self.required_services = services;
        self
    }

    pub fn matches(&self, record: &PeerRecord) -> bool {
        if self.ipv4_only && !record.address.is_ipv4() {
            return false;
        }
        record.services.has(self.required_services)
    }
}

impl Default for PeerFilter {
    fn default() -> Self {
        Self::any()
    }
}

/// Service flags are persisted as their raw bits.
mod service_bits {
    use bitcoin::p2p::ServiceFlags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flags: &ServiceFlags, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(flags.to_u64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ServiceFlags, D::Error> {
        u64::deserialize(deserializer).map(ServiceFlags::from)
    }
}
