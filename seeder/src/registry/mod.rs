//! The peer registry.
//!
//! [`PeerRegistry`] is a plain data structure holding one [`PeerRecord`] per
//! address. Every operation takes the current time explicitly. At runtime the
//! registry is owned by a single task (see [`spawn`]) and reached through a
//! cloneable [`RegistryHandle`], so mutations are applied one at a time in
//! arrival order and readers only ever see complete snapshots.

mod handle;
mod record;
mod store;

pub use handle::{spawn, RegistryHandle};
pub use record::{PeerFilter, PeerRecord, PeerSource, PeerStatus};
pub use store::{SnapshotStore, StoreError, SNAPSHOT_FORMAT_VERSION};

use bitcoin::p2p::ServiceFlags;
use bitcoin_seeder_connection::unix_timestamp;
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Consecutive failures after which a peer is considered unreachable.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
/// Wait after the first failure, doubled for every further one.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(60);
/// Upper bound on the failure backoff.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a successfully crawled peer rests before the next crawl.
pub const DEFAULT_REVISIT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Current unix time in seconds, as used for every registry timestamp.
pub(crate) fn now() -> u64 {
    unix_timestamp().max(0) as u64
}

/// Tunables for status transitions and crawl eligibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPolicy {
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub revisit_interval: Duration,
}

impl RegistryPolicy {
    /// Delay before retrying a peer that has failed `failures` times in a row.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        RegistryPolicy {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            revisit_interval: DEFAULT_REVISIT_INTERVAL,
        }
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub never_tried: usize,
    pub connected_recently: usize,
    pub unreachable: usize,
    pub banned: usize,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} peers ({} good, {} untried, {} unreachable, {} banned)",
            self.total, self.connected_recently, self.never_tried, self.unreachable, self.banned
        )
    }
}

/// All known peers, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: HashMap<SocketAddr, PeerRecord>,
    policy: RegistryPolicy,
}

impl PeerRegistry {
    pub fn new(policy: RegistryPolicy) -> Self {
        PeerRegistry {
            peers: HashMap::new(),
            policy,
        }
    }

    /// Builds a registry from previously persisted records.
    ///
    /// A later record for the same address replaces an earlier one.
    pub fn from_records(policy: RegistryPolicy, records: impl IntoIterator<Item = PeerRecord>) -> Self {
        let peers = records
            .into_iter()
            .map(|record| (record.address, record))
            .collect();
        PeerRegistry { peers, policy }
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&PeerRecord> {
        self.peers.get(address)
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Inserts a newly learned address, or refreshes a known one.
    ///
    /// New records start as [`PeerStatus::NeverTried`]. For known records only
    /// `last_seen` and the advertised services change, plus the source when the
    /// operator adds a peer by hand. Returns true if the address was new.
    pub fn upsert(
        &mut self,
        address: SocketAddr,
        source: PeerSource,
        services: ServiceFlags,
        now: u64,
    ) -> bool {
        match self.peers.get_mut(&address) {
            Some(record) => {
                record.last_seen = Some(now);
                record.services |= services;
                if source == PeerSource::Manual {
                    record.source = PeerSource::Manual;
                }
                false
            }
            None => {
                let mut record = PeerRecord::new(address, source);
                record.services = services;
                record.last_seen = Some(now);
                self.peers.insert(address, record);
                true
            }
        }
    }

    /// Notes that a crawl of `address` is starting.
    pub fn record_attempt(&mut self, address: &SocketAddr, now: u64) {
        if let Some(record) = self.peers.get_mut(address) {
            record.last_attempt = Some(now);
        }
    }

    /// Applies a completed handshake.
    ///
    /// `services` are merged into what is already known. Banned peers stay
    /// banned, only their timestamps move.
    pub fn record_success(&mut self, address: &SocketAddr, services: ServiceFlags, now: u64) {
        let revisit = self.policy.revisit_interval.as_secs();
        let Some(record) = self.peers.get_mut(address) else {
            debug!("Ignoring success for unknown peer {address}");
            return;
        };
        record.services |= services;
        record.last_seen = Some(now);
        record.last_success = Some(now);
        record.consecutive_failures = 0;
        record.eligible_at = Some(now.saturating_add(revisit));
        if record.status != PeerStatus::Banned {
            record.status = PeerStatus::ConnectedRecently;
        }
    }

    /// Applies a failed or timed out crawl and returns the resulting status.
    ///
    /// A peer that has never answered stays eligible until it reaches the
    /// failure threshold, only then does the backoff apply.
    pub fn record_failure(&mut self, address: &SocketAddr, now: u64) -> Option<PeerStatus> {
        let record = self.peers.get_mut(address)?;
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_attempt.get_or_insert(now);
        if record.status != PeerStatus::Banned
            && record.consecutive_failures >= self.policy.failure_threshold
        {
            record.status = PeerStatus::Unreachable;
        }
        record.eligible_at = match record.status {
            PeerStatus::NeverTried => None,
            _ => {
                let delay = self.policy.backoff(record.consecutive_failures).as_secs();
                Some(now.saturating_add(delay))
            }
        };
        Some(record.status)
    }

    /// Bans `address`, remembering it even if it was unknown so later gossip
    /// cannot bring it back.
    pub fn ban(&mut self, address: SocketAddr, now: u64) {
        let record = self
            .peers
            .entry(address)
            .or_insert_with(|| PeerRecord::new(address, PeerSource::Manual));
        record.status = PeerStatus::Banned;
        record.last_seen.get_or_insert(now);
    }

    /// Up to `count` distinct, uniformly chosen good peers matching `filter`.
    pub fn sample_active<R: Rng + ?Sized>(
        &self,
        count: usize,
        filter: &PeerFilter,
        rng: &mut R,
    ) -> Vec<PeerRecord> {
        let active: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|record| record.status == PeerStatus::ConnectedRecently)
            .filter(|record| filter.matches(record))
            .collect();
        active
            .choose_multiple(rng, count)
            .map(|record| (*record).clone())
            .collect()
    }

    /// Up to `count` addresses to crawl next.
    ///
    /// Never tried peers come first, then everything else whose backoff or
    /// revisit delay has elapsed, least recently attempted first. Banned peers
    /// and anything in `exclude` are never returned.
    pub fn candidates_for_crawl(
        &self,
        count: usize,
        now: u64,
        exclude: &HashSet<SocketAddr>,
    ) -> Vec<SocketAddr> {
        let mut eligible: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|record| record.is_eligible(now) && !exclude.contains(&record.address))
            .collect();
        eligible.sort_by_key(|record| {
            (
                record.status != PeerStatus::NeverTried,
                record.last_attempt,
                record.address,
            )
        });
        eligible
            .into_iter()
            .take(count)
            .map(|record| record.address)
            .collect()
    }

    /// Time until the next record outside `exclude` becomes eligible.
    ///
    /// Zero if one already is, `None` if there is nothing left to crawl.
    pub fn next_eligible_in(&self, now: u64, exclude: &HashSet<SocketAddr>) -> Option<Duration> {
        self.peers
            .values()
            .filter(|record| record.status != PeerStatus::Banned)
            .filter(|record| !exclude.contains(&record.address))
            .map(|record| match (record.status, record.eligible_at) {
                (PeerStatus::NeverTried, _) | (_, None) => 0,
                (_, Some(at)) => at.saturating_sub(now),
            })
            .min()
            .map(Duration::from_secs)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.peers.len(),
            ..RegistryStats::default()
        };
        for record in self.peers.values() {
            match record.status {
                PeerStatus::NeverTried => stats.never_tried += 1,
                PeerStatus::ConnectedRecently => stats.connected_recently += 1,
                PeerStatus::Unreachable => stats.unreachable += 1,
                PeerStatus::Banned => stats.banned += 1,
            }
        }
        stats
    }
}
