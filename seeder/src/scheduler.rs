//! Crawl scheduling.
//!
//! The [`CrawlScheduler`] keeps at most `max_concurrent_workers` crawls in
//! flight, picks what to crawl from the registry, and applies every worker
//! outcome back to the registry. When there is nothing to crawl and no good
//! peer is known, it bootstraps once from a DNS seed.

use crate::connection::Connector;
use crate::events::{EventSink, SeederEvent};
use crate::registry::{PeerSource, RegistryHandle};
use crate::shutdown::ShutdownSignal;
use crate::worker::{crawl, CrawlOutcome, CrawlResult, FailureReason, WorkerConfig};
use crate::SeederError;
use bitcoin::p2p::ServiceFlags;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, timeout_at, Instant, MissedTickBehavior};

/// Default size of the worker pool.
pub const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 8;
/// Default time outstanding crawls get to finish on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Default upper bound on an idle wait.
pub const DEFAULT_IDLE_CEILING: Duration = Duration::from_secs(30);
/// Default time between progress events.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// Bound on a single seed lookup.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_workers: usize,
    pub shutdown_grace: Duration,
    /// Longest the scheduler sleeps before checking the registry again.
    pub idle_ceiling: Duration,
    pub status_interval: Duration,
    /// Ban peers that send malformed or out of order messages.
    pub ban_protocol_violators: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent_workers: DEFAULT_MAX_CONCURRENT_WORKERS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            idle_ceiling: DEFAULT_IDLE_CEILING,
            status_interval: DEFAULT_STATUS_INTERVAL,
            ban_protocol_violators: false,
        }
    }
}

/// Source of bootstrap addresses.
pub trait SeedResolver: Send + Sync + 'static {
    /// Name used in events and errors.
    fn name(&self) -> String;

    fn resolve(&self) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send;
}

/// Resolves a DNS seed hostname through the system resolver.
#[derive(Debug, Clone)]
pub struct DnsSeedResolver {
    host: String,
    port: u16,
}

impl DnsSeedResolver {
    /// `port` is applied to every resolved address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        DnsSeedResolver {
            host: host.into(),
            port,
        }
    }
}

impl SeedResolver for DnsSeedResolver {
    fn name(&self) -> String {
        self.host.clone()
    }

    fn resolve(&self) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send {
        let host = self.host.clone();
        let port = self.port;
        async move {
            let addresses = tokio::net::lookup_host((host.as_str(), port)).await?;
            Ok(addresses.collect())
        }
    }
}

pub struct CrawlScheduler<C, S> {
    registry: RegistryHandle,
    connector: C,
    resolver: S,
    worker: Arc<WorkerConfig>,
    config: SchedulerConfig,
    events: EventSink,
    bootstrapped: bool,
}

impl<C: Connector, S: SeedResolver> CrawlScheduler<C, S> {
    pub fn new(
        registry: RegistryHandle,
        connector: C,
        resolver: S,
        worker: WorkerConfig,
        config: SchedulerConfig,
        events: EventSink,
    ) -> Self {
        CrawlScheduler {
            registry,
            connector,
            resolver,
            worker: Arc::new(worker),
            config,
            events,
            bootstrapped: false,
        }
    }

    /// Crawls until `shutdown` fires, then gives outstanding crawls the grace
    /// period to report before abandoning them.
    ///
    /// Only fails if the registry goes away or bootstrapping is impossible.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<(), SeederError> {
        let capacity = self.config.max_concurrent_workers.max(1);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(capacity);
        let mut in_flight: HashMap<SocketAddr, JoinHandle<()>> = HashMap::new();
        let period = self.config.status_interval;
        let mut status = interval_at(Instant::now() + period, period);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Crawl scheduler started with {capacity} workers");

        loop {
            if shutdown.is_triggered() {
                break;
            }
            self.dispatch(&mut in_flight, &outcome_tx, &mut shutdown)
                .await?;

            let idle = if in_flight.len() < capacity {
                let exclude = in_flight.keys().copied().collect();
                self.registry
                    .next_eligible_in(exclude)
                    .await?
                    .map_or(self.config.idle_ceiling, |wait| {
                        wait.min(self.config.idle_ceiling)
                    })
            } else {
                self.config.idle_ceiling
            };

            tokio::select! {
                _ = shutdown.triggered() => break,
                Some(outcome) = outcome_rx.recv() => {
                    in_flight.remove(&outcome.address);
                    self.apply(outcome).await?;
                }
                _ = sleep(idle) => {}
                _ = status.tick() => {
                    let stats = self.registry.stats().await?;
                    self.events.emit(SeederEvent::SchedulerStatus {
                        in_flight: in_flight.len(),
                        stats,
                    });
                }
            }
        }

        self.drain(in_flight, outcome_rx).await
    }

    /// Fills free worker slots with eligible peers.
    async fn dispatch(
        &mut self,
        in_flight: &mut HashMap<SocketAddr, JoinHandle<()>>,
        outcome_tx: &mpsc::Sender<CrawlOutcome>,
        shutdown: &mut ShutdownSignal,
    ) -> Result<(), SeederError> {
        let free = self
            .config
            .max_concurrent_workers
            .max(1)
            .saturating_sub(in_flight.len());
        if free == 0 {
            return Ok(());
        }

        let exclude: HashSet<SocketAddr> = in_flight.keys().copied().collect();
        let candidates = self.registry.candidates_for_crawl(free, exclude).await?;
        if candidates.is_empty() {
            // Peers still in flight may yet turn out good or come back eligible.
            if !self.bootstrapped
                && in_flight.is_empty()
                && self.registry.stats().await?.connected_recently == 0
            {
                self.bootstrap(shutdown).await?;
            }
            return Ok(());
        }

        for address in candidates {
            self.registry.record_attempt(address).await?;
            let connector = self.connector.clone();
            let config = self.worker.clone();
            let outcome_tx = outcome_tx.clone();
            let handle = tokio::spawn(async move {
                let outcome = crawl(&connector, address, &config).await;
                // Closed only once the scheduler has abandoned this crawl.
                let _ = outcome_tx.send(outcome).await;
            });
            in_flight.insert(address, handle);
        }
        debug!("{} crawls in flight", in_flight.len());
        Ok(())
    }

    /// Runs at most once per scheduler. Shutdown cuts the seed lookup short.
    async fn bootstrap(&mut self, shutdown: &mut ShutdownSignal) -> Result<(), SeederError> {
        self.bootstrapped = true;
        let seed = self.resolver.name();
        info!("Bootstrapping from {seed}");

        let lookup = tokio::select! {
            _ = shutdown.triggered() => {
                debug!("Bootstrap from {seed} abandoned on shutdown");
                return Ok(());
            }
            lookup = timeout(BOOTSTRAP_TIMEOUT, self.resolver.resolve()) => lookup,
        };
        let error = match lookup {
            Ok(Ok(addresses)) if !addresses.is_empty() => {
                let resolved = addresses.len();
                let peers = addresses
                    .into_iter()
                    .map(|address| (address, ServiceFlags::NONE))
                    .collect();
                let added = self.registry.upsert_many(peers, PeerSource::Seed).await?;
                self.events
                    .emit(SeederEvent::Bootstrapped { seed, resolved });
                if added > 0 {
                    self.events.emit(SeederEvent::PeersDiscovered {
                        source: PeerSource::Seed,
                        count: added,
                    });
                }
                return Ok(());
            }
            Ok(Ok(_)) => "seed returned no addresses".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(_) => "seed lookup timed out".to_string(),
        };

        let stats = self.registry.stats().await?;
        if stats.total == stats.banned {
            return Err(SeederError::Bootstrap {
                seed,
                reason: error,
            });
        }
        self.events
            .emit(SeederEvent::BootstrapFailed { seed, error });
        Ok(())
    }

    /// Records a worker outcome in the registry.
    async fn apply(&mut self, outcome: CrawlOutcome) -> Result<(), SeederError> {
        let address = outcome.address;
        match outcome.result {
            CrawlResult::Success(report) => {
                self.registry
                    .record_success(address, report.services)
                    .await?;
                let peers: Vec<_> = report
                    .advertised
                    .iter()
                    .filter(|peer| peer.address.port() != 0 && !peer.address.ip().is_unspecified())
                    .map(|peer| (peer.address, peer.services))
                    .collect();
                if !peers.is_empty() {
                    let added = self.registry.upsert_many(peers, PeerSource::Gossip).await?;
                    if added > 0 {
                        self.events.emit(SeederEvent::PeersDiscovered {
                            source: PeerSource::Gossip,
                            count: added,
                        });
                    }
                }
                self.events.emit(SeederEvent::PeerListening {
                    address,
                    services: report.services,
                    version: report.version,
                    user_agent: report.user_agent,
                    advertised: report.advertised.len(),
                });
            }
            CrawlResult::Failure(reason) => {
                self.registry.record_failure(address).await?;
                let ban = reason == FailureReason::ConnectionLoop
                    || (self.config.ban_protocol_violators && reason.is_protocol_violation());
                if ban {
                    self.registry.ban(address).await?;
                    self.events.emit(SeederEvent::PeerBanned {
                        address,
                        reason: reason.to_string(),
                    });
                }
                self.events.emit(SeederEvent::PeerFailed {
                    address,
                    reason: reason.to_string(),
                });
            }
            CrawlResult::Timeout(state) => {
                self.registry.record_failure(address).await?;
                self.events.emit(SeederEvent::PeerFailed {
                    address,
                    reason: format!("timed out while {state}"),
                });
            }
        }
        Ok(())
    }

    /// Applies outcomes that arrive within the grace period, abandons the rest.
    async fn drain(
        &mut self,
        mut in_flight: HashMap<SocketAddr, JoinHandle<()>>,
        mut outcome_rx: mpsc::Receiver<CrawlOutcome>,
    ) -> Result<(), SeederError> {
        if !in_flight.is_empty() {
            info!(
                "Waiting up to {:?} for {} outstanding crawls",
                self.config.shutdown_grace,
                in_flight.len()
            );
        }
        let deadline = Instant::now() + self.config.shutdown_grace;
        while !in_flight.is_empty() {
            match timeout_at(deadline, outcome_rx.recv()).await {
                Ok(Some(outcome)) => {
                    in_flight.remove(&outcome.address);
                    self.apply(outcome).await?;
                }
                Ok(None) | Err(_) => break,
            }
        }
        for (address, handle) in in_flight {
            debug!("Abandoning crawl of {address}");
            handle.abort();
        }
        info!("Crawl scheduler stopped");
        Ok(())
    }
}
