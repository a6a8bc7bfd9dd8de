//! Authoritative DNS answers for the seed domain.

mod responder;
pub mod wire;

pub use responder::DnsResponder;

use crate::registry::PeerFilter;
use bitcoin::p2p::ServiceFlags;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Default record TTL in seconds.
pub const DEFAULT_TTL: u32 = 60;
/// Default number of A records per response.
pub const DEFAULT_MAX_ANSWERS: usize = 10;
/// Most A records a response may be configured to carry. This many fit one
/// datagram for a `x<hex>` name under a short seed domain, longer names get
/// truncated responses.
pub const MAX_ANSWERS: usize = 28;
/// Default number of queries answered concurrently, excess datagrams are dropped.
pub const DEFAULT_MAX_PENDING_QUERIES: usize = 256;
/// Default listen address.
pub const DEFAULT_BIND: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 53));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    /// Normalized with [`normalize_domain`].
    pub domain: String,
    pub bind: SocketAddr,
    pub ttl: u32,
    pub max_answers: usize,
    pub max_pending_queries: usize,
}

impl DnsConfig {
    /// Returns `None` if `domain` is not a valid hostname.
    pub fn new(domain: &str) -> Option<Self> {
        Some(DnsConfig {
            domain: normalize_domain(domain)?,
            bind: DEFAULT_BIND,
            ttl: DEFAULT_TTL,
            max_answers: DEFAULT_MAX_ANSWERS,
            max_pending_queries: DEFAULT_MAX_PENDING_QUERIES,
        })
    }

    /// Maps a query name to the peers it may be answered with.
    ///
    /// The bare domain serves any good IPv4 peer. `x<hex>.<domain>` only
    /// serves peers advertising all of the service bits in `<hex>`. Anything
    /// else is outside our zone.
    pub fn filter_for(&self, name: &str) -> Option<PeerFilter> {
        let name = name.trim_end_matches('.');
        if name.eq_ignore_ascii_case(&self.domain) {
            return Some(PeerFilter::ipv4());
        }
        let name = name.to_ascii_lowercase();
        let hex = name
            .strip_suffix(self.domain.as_str())?
            .strip_suffix('.')?
            .strip_prefix('x')?;
        if hex.is_empty() || hex.len() > 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let bits = u64::from_str_radix(hex, 16).ok()?;
        Some(PeerFilter::ipv4().with_services(ServiceFlags::from(bits)))
    }
}

/// Lowercases `domain` and strips a trailing dot.
///
/// Returns `None` unless every label is 1 to 63 letters, digits or hyphens.
pub fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.strip_suffix('.').unwrap_or(domain).to_ascii_lowercase();
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            (1..=63).contains(&label.len())
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    valid.then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(
            normalize_domain("Seed.Example.com."),
            Some("seed.example.com".to_string())
        );
        assert_eq!(normalize_domain(""), None);
        assert_eq!(normalize_domain("."), None);
        assert_eq!(normalize_domain("seed..example.com"), None);
        assert_eq!(normalize_domain("seed_1.example.com"), None);
    }

    #[test]
    fn test_filter_for() {
        let config = DnsConfig::new("seed.example.com").unwrap();

        assert_eq!(config.filter_for("seed.example.com"), Some(PeerFilter::ipv4()));
        assert_eq!(config.filter_for("SEED.example.com."), Some(PeerFilter::ipv4()));
        assert_eq!(
            config.filter_for("x9.seed.example.com"),
            Some(PeerFilter::ipv4().with_services(ServiceFlags::NETWORK | ServiceFlags::WITNESS))
        );
        assert_eq!(config.filter_for("other.example.com"), None);
        assert_eq!(config.filter_for("evilseed.example.com"), None);
        assert_eq!(config.filter_for("www.seed.example.com"), None);
        assert_eq!(config.filter_for("x.seed.example.com"), None);
        assert_eq!(config.filter_for("xzz.seed.example.com"), None);
        assert_eq!(config.filter_for("a.x9.seed.example.com"), None);
    }
}
