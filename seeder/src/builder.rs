//! Builder pattern for configuring a seeder.

use crate::dns::{
    normalize_domain, DnsConfig, DEFAULT_BIND, DEFAULT_MAX_ANSWERS, DEFAULT_MAX_PENDING_QUERIES,
    DEFAULT_TTL, MAX_ANSWERS,
};
use crate::registry::RegistryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerConfig;
use bitcoin::Network;
use bitcoin_seeder_connection::{
    ConnectionConfiguration, UserAgent, UserAgentError, DEFAULT_PROTOCOL_VERSION,
};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// DNS seed used to bootstrap an empty registry.
pub const DEFAULT_SEED_HOST: &str = "seed.bitcoin.sipa.be";
/// Default registry snapshot location.
pub const DEFAULT_SNAPSHOT_PATH: &str = "peers.json";
/// Default time between registry snapshots.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default p2p port of `network`.
pub fn default_port(network: Network) -> u16 {
    match network {
        Network::Bitcoin => 8333,
        Network::Signet => 38333,
        Network::Regtest => 18444,
        _ => 18333,
    }
}

/// Errors that can occur during seeder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeederBuilderError {
    /// User agent doesn't follow the required format.
    InvalidUserAgent(UserAgentError),
    /// No seed domain was configured.
    MissingDomain,
    /// Seed domain is not a valid hostname.
    InvalidDomain(String),
    ZeroWorkers,
    ZeroFailureThreshold,
    /// Answers per response must be between 1 and [`MAX_ANSWERS`].
    InvalidMaxAnswers(usize),
    ZeroPendingQueries,
    /// Backoff base is zero or above the cap.
    InvalidBackoff,
}

impl fmt::Display for SeederBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeederBuilderError::InvalidUserAgent(err) => write!(f, "Invalid user agent: {err}"),
            SeederBuilderError::MissingDomain => write!(f, "No seed domain configured"),
            SeederBuilderError::InvalidDomain(domain) => {
                write!(f, "Invalid seed domain: {domain:?}")
            }
            SeederBuilderError::ZeroWorkers => write!(f, "Worker pool size must be at least 1"),
            SeederBuilderError::ZeroFailureThreshold => {
                write!(f, "Failure threshold must be at least 1")
            }
            SeederBuilderError::InvalidMaxAnswers(count) => {
                write!(f, "DNS responses must carry 1 to {MAX_ANSWERS} answers, not {count}")
            }
            SeederBuilderError::ZeroPendingQueries => {
                write!(f, "At least 1 DNS query must be allowed in flight")
            }
            SeederBuilderError::InvalidBackoff => {
                write!(f, "Backoff base must be non-zero and not exceed the cap")
            }
        }
    }
}

impl std::error::Error for SeederBuilderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SeederBuilderError::InvalidUserAgent(err) => Some(err),
            _ => None,
        }
    }
}

/// Everything a [`Seeder`](crate::Seeder) needs to run.
#[derive(Debug, Clone)]
pub struct SeederConfig {
    pub network: Network,
    pub registry: RegistryPolicy,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub dns: DnsConfig,
    /// Hostname resolved to bootstrap an empty registry.
    pub seed_host: String,
    pub seed_port: u16,
    /// `None` keeps the registry in memory only.
    pub snapshot_path: Option<PathBuf>,
    /// `None` only persists on shutdown.
    pub flush_interval: Option<Duration>,
    /// Added to the registry on startup.
    pub manual_peers: Vec<SocketAddr>,
    /// Banned on startup, never crawled or served.
    pub banned_peers: Vec<SocketAddr>,
}

/// Builder for a validated [`SeederConfig`].
///
/// # Example
///
/// ```
/// # fn main() -> Result<(), bitcoin_seeder::SeederBuilderError> {
/// use bitcoin::Network;
/// use bitcoin_seeder::SeederBuilder;
/// use std::time::Duration;
///
/// let config = SeederBuilder::new(Network::Bitcoin)
///     .with_dns_domain("seed.example.com")?
///     .with_user_agent("/my-seeder:0.1.0/")?
///     .with_max_concurrent_workers(16)
///     .with_handshake_timeout(Duration::from_secs(10))
///     .build()?;
/// assert_eq!(config.dns.domain, "seed.example.com");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SeederBuilder {
    network: Network,
    user_agent: Option<UserAgent>,
    protocol_version: u32,
    registry: RegistryPolicy,
    worker: WorkerConfig,
    scheduler: SchedulerConfig,
    domain: Option<String>,
    dns_bind: SocketAddr,
    ttl: u32,
    max_answers: usize,
    max_pending_queries: usize,
    seed_host: String,
    seed_port: u16,
    snapshot_path: Option<PathBuf>,
    flush_interval: Option<Duration>,
    manual_peers: Vec<SocketAddr>,
    banned_peers: Vec<SocketAddr>,
}

impl SeederBuilder {
    /// Create a new seeder builder for the specified network.
    ///
    /// # Arguments
    ///
    /// * `network` - The bitcoin network to crawl and serve.
    ///
    /// # Returns
    ///
    /// A new `SeederBuilder` with every setting at its default.
    pub fn new(network: Network) -> Self {
        SeederBuilder {
            network,
            user_agent: None,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            registry: RegistryPolicy::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            domain: None,
            dns_bind: DEFAULT_BIND,
            ttl: DEFAULT_TTL,
            max_answers: DEFAULT_MAX_ANSWERS,
            max_pending_queries: DEFAULT_MAX_PENDING_QUERIES,
            seed_host: DEFAULT_SEED_HOST.to_string(),
            seed_port: default_port(network),
            snapshot_path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            manual_peers: Vec::new(),
            banned_peers: Vec::new(),
        }
    }

    /// Set a custom user agent string.
    ///
    /// It must follow Bitcoin Core's convention: "/Name:Version/".
    ///
    /// # Arguments
    ///
    /// * `user_agent` - The user agent string to use.
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - The builder for method chaining if validation succeeds.
    /// * `Err(SeederBuilderError)` - If the user agent format is invalid.
    pub fn with_user_agent<S: Into<String>>(
        mut self,
        user_agent: S,
    ) -> Result<Self, SeederBuilderError> {
        let user_agent =
            UserAgent::new(user_agent.into()).map_err(SeederBuilderError::InvalidUserAgent)?;
        self.user_agent = Some(user_agent);
        Ok(self)
    }

    /// Set the protocol version to advertise in handshakes.
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the domain the DNS responder is authoritative for.
    ///
    /// # Arguments
    ///
    /// * `domain` - Hostname such as `seed.example.com`, trailing dot optional.
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - The builder for method chaining.
    /// * `Err(SeederBuilderError)` - If `domain` is not a valid hostname.
    pub fn with_dns_domain(mut self, domain: &str) -> Result<Self, SeederBuilderError> {
        let normalized = normalize_domain(domain)
            .ok_or_else(|| SeederBuilderError::InvalidDomain(domain.to_string()))?;
        self.domain = Some(normalized);
        Ok(self)
    }

    /// Set the UDP address the DNS responder listens on (defaults to `0.0.0.0:53`).
    pub fn with_dns_bind(mut self, address: SocketAddr) -> Self {
        self.dns_bind = address;
        self
    }

    pub fn with_dns_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the number of A records per response (defaults to 10, at most 28).
    pub fn with_max_answers(mut self, max_answers: usize) -> Self {
        self.max_answers = max_answers;
        self
    }

    /// Set how many DNS queries may be answered at once (defaults to 256).
    ///
    /// Datagrams arriving while the limit is reached are dropped.
    pub fn with_max_pending_queries(mut self, max_pending: usize) -> Self {
        self.max_pending_queries = max_pending;
        self
    }

    /// Set the maximum number of concurrent crawls.
    ///
    /// # Recommendations
    ///
    /// * **Conservative (1-4)** - For slow networks or resource-constrained environments.
    /// * **Default (8)** - Good balance for most use cases.
    /// * **Aggressive (16-64)** - For fast crawling with ample resources.
    ///
    /// # Arguments
    ///
    /// * `max_workers` - Maximum concurrent crawls (defaults to 8).
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_max_concurrent_workers(mut self, max_workers: usize) -> Self {
        self.scheduler.max_concurrent_workers = max_workers;
        self
    }

    /// Set the TCP connect timeout (defaults to 10 seconds).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.worker.connect_timeout = timeout;
        self
    }

    /// Set the time allowed for the version handshake (defaults to 20 seconds).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.worker.handshake_timeout = timeout;
        self
    }

    /// Set how long to collect `addr` replies after `getaddr`.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Overall collection window (defaults to 20 seconds).
    /// * `quiet_period` - Silence after a batch that ends collection early
    ///   (defaults to 5 seconds).
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_addr_timeout(mut self, timeout: Duration, quiet_period: Duration) -> Self {
        self.worker.addr_timeout = timeout;
        self.worker.addr_quiet_period = quiet_period;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.worker.write_timeout = timeout;
        self
    }

    /// Cap the addresses taken from a single peer (defaults to 1000).
    pub fn with_max_addresses(mut self, max_addresses: usize) -> Self {
        self.worker.max_addresses = max_addresses;
        self
    }

    /// Set the consecutive failures after which a peer is unreachable.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.registry.failure_threshold = threshold;
        self
    }

    /// Set the retry backoff after failures.
    ///
    /// # Arguments
    ///
    /// * `base` - Wait after the first failure, doubled per further failure.
    /// * `cap` - Longest wait.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.registry.backoff_base = base;
        self.registry.backoff_cap = cap;
        self
    }

    /// Set how long a good peer rests before it is crawled again.
    pub fn with_revisit_interval(mut self, interval: Duration) -> Self {
        self.registry.revisit_interval = interval;
        self
    }

    /// Set the DNS seed used when the registry has nothing to crawl.
    pub fn with_seed(mut self, host: impl Into<String>, port: u16) -> Self {
        self.seed_host = host.into();
        self.seed_port = port;
        self
    }

    /// Set where the registry snapshot lives, `None` to keep it in memory.
    pub fn with_snapshot_path(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_path = path;
        self
    }

    /// Set the periodic snapshot interval, `None` to only save on shutdown.
    pub fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the time outstanding crawls get to finish on shutdown.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.scheduler.shutdown_grace = grace;
        self
    }

    /// Add peers to crawl in addition to whatever gossip turns up.
    pub fn with_manual_peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.manual_peers.extend(peers);
        self
    }

    /// Add peers that must never be crawled or served.
    pub fn with_banned_peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.banned_peers.extend(peers);
        self
    }

    /// Ban peers that send malformed or out of order messages, not just
    /// those that turn out to be ourselves.
    pub fn with_ban_protocol_violators(mut self, ban: bool) -> Self {
        self.scheduler.ban_protocol_violators = ban;
        self
    }

    /// Validate the settings.
    ///
    /// # Returns
    ///
    /// * `Ok(SeederConfig)` - The configuration to hand to [`Seeder::new`](crate::Seeder::new).
    /// * `Err(SeederBuilderError)` - If a setting is missing or out of range.
    pub fn build(self) -> Result<SeederConfig, SeederBuilderError> {
        let domain = self.domain.ok_or(SeederBuilderError::MissingDomain)?;
        if self.scheduler.max_concurrent_workers == 0 {
            return Err(SeederBuilderError::ZeroWorkers);
        }
        if self.registry.failure_threshold == 0 {
            return Err(SeederBuilderError::ZeroFailureThreshold);
        }
        if !(1..=MAX_ANSWERS).contains(&self.max_answers) {
            return Err(SeederBuilderError::InvalidMaxAnswers(self.max_answers));
        }
        if self.max_pending_queries == 0 {
            return Err(SeederBuilderError::ZeroPendingQueries);
        }
        if self.registry.backoff_base.is_zero()
            || self.registry.backoff_base > self.registry.backoff_cap
        {
            return Err(SeederBuilderError::InvalidBackoff);
        }

        let mut worker = self.worker;
        worker.connection = ConnectionConfiguration::non_listening(
            self.protocol_version,
            self.user_agent,
        );
        let dns = DnsConfig {
            domain,
            bind: self.dns_bind,
            ttl: self.ttl,
            max_answers: self.max_answers,
            max_pending_queries: self.max_pending_queries,
        };

        Ok(SeederConfig {
            network: self.network,
            registry: self.registry,
            worker,
            scheduler: self.scheduler,
            dns,
            seed_host: self.seed_host,
            seed_port: self.seed_port,
            snapshot_path: self.snapshot_path,
            flush_interval: self.flush_interval,
            manual_peers: self.manual_peers,
            banned_peers: self.banned_peers,
        })
    }
}
