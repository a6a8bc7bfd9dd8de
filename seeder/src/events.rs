//! Structured events emitted by the seeder's components.
//!
//! Components push [`SeederEvent`]s into an [`EventSink`] without waiting. A
//! single consumer, usually [`log_events`], drains them. A full buffer drops
//! the event, a slow consumer never stalls crawling or DNS answers.

use crate::registry::{PeerSource, RegistryStats};
use bitcoin::p2p::ServiceFlags;
use log::Level;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Default number of events buffered ahead of the consumer.
pub const DEFAULT_EVENT_BUFFER: usize = 4096;

/// Which part of the seeder an event came from. Used as the log target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Crawl,
    Registry,
    Dns,
    Bootstrap,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Crawl => "crawl",
            EventCategory::Registry => "registry",
            EventCategory::Dns => "dns",
            EventCategory::Bootstrap => "bootstrap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeederEvent {
    /// A crawl completed a handshake.
    PeerListening {
        address: SocketAddr,
        services: ServiceFlags,
        version: u32,
        user_agent: String,
        advertised: usize,
    },
    /// A crawl failed or timed out.
    PeerFailed {
        address: SocketAddr,
        reason: String,
    },
    /// Addresses learned from a crawl or the seed that were not known before.
    PeersDiscovered { source: PeerSource, count: usize },
    PeerBanned { address: SocketAddr, reason: String },
    Bootstrapped { seed: String, resolved: usize },
    BootstrapFailed { seed: String, error: String },
    SnapshotLoaded { path: String, peers: usize },
    SnapshotSaved { path: String, peers: usize },
    /// Loading or saving a snapshot failed.
    SnapshotFailed { path: String, error: String },
    DnsAnswered {
        client: SocketAddr,
        name: String,
        answers: usize,
    },
    DnsRejected {
        client: SocketAddr,
        name: String,
        rcode: u8,
    },
    DnsMalformed { client: SocketAddr, error: String },
    /// Periodic crawl progress.
    SchedulerStatus { in_flight: usize, stats: RegistryStats },
}

impl SeederEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            SeederEvent::PeerListening { .. }
            | SeederEvent::PeerFailed { .. }
            | SeederEvent::PeersDiscovered { .. }
            | SeederEvent::SchedulerStatus { .. } => EventCategory::Crawl,
            SeederEvent::PeerBanned { .. }
            | SeederEvent::SnapshotLoaded { .. }
            | SeederEvent::SnapshotSaved { .. }
            | SeederEvent::SnapshotFailed { .. } => EventCategory::Registry,
            SeederEvent::Bootstrapped { .. } | SeederEvent::BootstrapFailed { .. } => {
                EventCategory::Bootstrap
            }
            SeederEvent::DnsAnswered { .. }
            | SeederEvent::DnsRejected { .. }
            | SeederEvent::DnsMalformed { .. } => EventCategory::Dns,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            SeederEvent::SnapshotFailed { .. } | SeederEvent::BootstrapFailed { .. } => Level::Warn,
            SeederEvent::Bootstrapped { .. }
            | SeederEvent::SnapshotLoaded { .. }
            | SeederEvent::PeerBanned { .. }
            | SeederEvent::SchedulerStatus { .. } => Level::Info,
            SeederEvent::PeerListening { .. }
            | SeederEvent::PeersDiscovered { .. }
            | SeederEvent::SnapshotSaved { .. }
            | SeederEvent::DnsRejected { .. }
            | SeederEvent::DnsMalformed { .. } => Level::Debug,
            SeederEvent::PeerFailed { .. } | SeederEvent::DnsAnswered { .. } => Level::Trace,
        }
    }
}

impl fmt::Display for SeederEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeederEvent::PeerListening {
                address,
                services,
                version,
                user_agent,
                advertised,
            } => write!(
                f,
                "{address} is listening: version {version} {user_agent} services {services}, advertised {advertised} addresses"
            ),
            SeederEvent::PeerFailed { address, reason } => {
                write!(f, "{address} failed: {reason}")
            }
            SeederEvent::PeersDiscovered { source, count } => {
                write!(f, "Discovered {count} new peers via {source}")
            }
            SeederEvent::PeerBanned { address, reason } => {
                write!(f, "Banned {address}: {reason}")
            }
            SeederEvent::Bootstrapped { seed, resolved } => {
                write!(f, "Bootstrapped {resolved} peers from {seed}")
            }
            SeederEvent::BootstrapFailed { seed, error } => {
                write!(f, "Bootstrap from {seed} failed: {error}")
            }
            SeederEvent::SnapshotLoaded { path, peers } => {
                write!(f, "Loaded {peers} peers from {path}")
            }
            SeederEvent::SnapshotSaved { path, peers } => {
                write!(f, "Saved {peers} peers to {path}")
            }
            SeederEvent::SnapshotFailed { path, error } => {
                write!(f, "Snapshot {path} failed: {error}")
            }
            SeederEvent::DnsAnswered {
                client,
                name,
                answers,
            } => write!(f, "Answered {name} for {client} with {answers} records"),
            SeederEvent::DnsRejected {
                client,
                name,
                rcode,
            } => write!(f, "Rejected {name} for {client} with rcode {rcode}"),
            SeederEvent::DnsMalformed { client, error } => {
                write!(f, "Dropped malformed query from {client}: {error}")
            }
            SeederEvent::SchedulerStatus { in_flight, stats } => {
                write!(f, "{in_flight} crawls in flight, {stats}")
            }
        }
    }
}

/// Where components send events. Cloning shares the same consumer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SeederEvent>>,
}

impl EventSink {
    /// A sink and the receiving end its events arrive on.
    pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<SeederEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink { tx: Some(tx) }, rx)
    }

    /// A sink which discards everything.
    pub fn disabled() -> Self {
        EventSink { tx: None }
    }

    /// Queues `event` if there is room, never waits.
    pub fn emit(&self, event: SeederEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Logs every event through the `log` facade until all sinks are dropped.
pub async fn log_events(mut rx: mpsc::Receiver<SeederEvent>) {
    while let Some(event) = rx.recv().await {
        log::log!(target: event.category().as_str(), event.level(), "{event}");
    }
}
