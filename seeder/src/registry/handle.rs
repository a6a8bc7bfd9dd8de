//! The registry task and its handle.

use super::{now, PeerFilter, PeerRecord, PeerRegistry, PeerSource, RegistryStats, SnapshotStore};
use crate::events::{EventSink, SeederEvent};
use crate::SeederError;
use bitcoin::p2p::ServiceFlags;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Commands buffered ahead of the registry task before senders wait.
const COMMAND_BUFFER: usize = 1024;

enum Command {
    Upsert {
        peers: Vec<(SocketAddr, ServiceFlags)>,
        source: PeerSource,
        reply: oneshot::Sender<usize>,
    },
    RecordAttempt(SocketAddr),
    RecordSuccess {
        address: SocketAddr,
        services: ServiceFlags,
    },
    RecordFailure(SocketAddr),
    Ban(SocketAddr),
    Get {
        address: SocketAddr,
        reply: oneshot::Sender<Option<PeerRecord>>,
    },
    SampleActive {
        count: usize,
        filter: PeerFilter,
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    Candidates {
        count: usize,
        exclude: HashSet<SocketAddr>,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    NextEligible {
        exclude: HashSet<SocketAddr>,
        reply: oneshot::Sender<Option<Duration>>,
    },
    Stats(oneshot::Sender<RegistryStats>),
    Persist(oneshot::Sender<Option<usize>>),
    Shutdown(oneshot::Sender<()>),
}

/// Starts the task owning `registry`.
///
/// With a store, the registry is written every `flush_interval` and once more
/// when the task stops, either through [`RegistryHandle::shutdown`] or because
/// every handle was dropped.
pub fn spawn(
    registry: PeerRegistry,
    store: Option<SnapshotStore>,
    flush_interval: Option<Duration>,
    events: EventSink,
) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let flush = flush_interval.map(|period| {
        let mut flush = interval_at(Instant::now() + period, period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush
    });
    let task = RegistryTask {
        registry,
        store,
        events,
        rng: StdRng::from_entropy(),
    };
    let join = tokio::spawn(task.run(rx, flush));
    (RegistryHandle { tx }, join)
}

struct RegistryTask {
    registry: PeerRegistry,
    store: Option<SnapshotStore>,
    events: EventSink,
    rng: StdRng,
}

impl RegistryTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut flush: Option<Interval>) {
        debug!("Registry task started with {} peers", self.registry.len());
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.persist().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.apply(command).await,
                    None => {
                        self.persist().await;
                        break;
                    }
                },
                _ = tick(&mut flush) => {
                    self.persist().await;
                }
            }
        }
        info!("Registry stopped: {}", self.registry.stats());
    }

    async fn apply(&mut self, command: Command) {
        let registry = &mut self.registry;
        match command {
            Command::Upsert {
                peers,
                source,
                reply,
            } => {
                let now = now();
                let added = peers
                    .into_iter()
                    .filter(|(address, services)| registry.upsert(*address, source, *services, now))
                    .count();
                let _ = reply.send(added);
            }
            Command::RecordAttempt(address) => registry.record_attempt(&address, now()),
            Command::RecordSuccess { address, services } => {
                registry.record_success(&address, services, now())
            }
            Command::RecordFailure(address) => {
                registry.record_failure(&address, now());
            }
            Command::Ban(address) => registry.ban(address, now()),
            Command::Get { address, reply } => {
                let _ = reply.send(registry.get(&address).cloned());
            }
            Command::SampleActive {
                count,
                filter,
                reply,
            } => {
                let _ = reply.send(registry.sample_active(count, &filter, &mut self.rng));
            }
            Command::Candidates {
                count,
                exclude,
                reply,
            } => {
                let _ = reply.send(registry.candidates_for_crawl(count, now(), &exclude));
            }
            Command::NextEligible { exclude, reply } => {
                let _ = reply.send(registry.next_eligible_in(now(), &exclude));
            }
            Command::Stats(reply) => {
                let _ = reply.send(registry.stats());
            }
            Command::Persist(reply) => {
                let saved = self.persist().await;
                let _ = reply.send(saved);
            }
            // Handled by the run loop.
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn persist(&mut self) -> Option<usize> {
        let store = self.store.as_ref()?;
        let path = store.path().display().to_string();
        match store.save(self.registry.records(), now()).await {
            Ok(peers) => {
                self.events.emit(SeederEvent::SnapshotSaved { path, peers });
                Some(peers)
            }
            Err(err) => {
                self.events.emit(SeederEvent::SnapshotFailed {
                    path,
                    error: err.to_string(),
                });
                None
            }
        }
    }
}

async fn tick(flush: &mut Option<Interval>) {
    match flush {
        Some(flush) => {
            flush.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Cloneable access to the registry task.
///
/// Every call fails with [`SeederError::RegistryClosed`] once the task is gone.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    async fn send(&self, command: Command) -> Result<(), SeederError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SeederError::RegistryClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SeederError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| SeederError::RegistryClosed)
    }

    /// Upserts a single address.
    pub async fn upsert(&self, address: SocketAddr, source: PeerSource) -> Result<bool, SeederError> {
        self.upsert_many(vec![(address, ServiceFlags::NONE)], source)
            .await
            .map(|added| added > 0)
    }

    /// Upserts a batch and returns how many addresses were new.
    pub async fn upsert_many(
        &self,
        peers: Vec<(SocketAddr, ServiceFlags)>,
        source: PeerSource,
    ) -> Result<usize, SeederError> {
        self.request(|reply| Command::Upsert {
            peers,
            source,
            reply,
        })
        .await
    }

    pub async fn record_attempt(&self, address: SocketAddr) -> Result<(), SeederError> {
        self.send(Command::RecordAttempt(address)).await
    }

    pub async fn record_success(
        &self,
        address: SocketAddr,
        services: ServiceFlags,
    ) -> Result<(), SeederError> {
        self.send(Command::RecordSuccess { address, services }).await
    }

    pub async fn record_failure(&self, address: SocketAddr) -> Result<(), SeederError> {
        self.send(Command::RecordFailure(address)).await
    }

    pub async fn ban(&self, address: SocketAddr) -> Result<(), SeederError> {
        self.send(Command::Ban(address)).await
    }

    pub async fn get(&self, address: SocketAddr) -> Result<Option<PeerRecord>, SeederError> {
        self.request(|reply| Command::Get { address, reply }).await
    }

    pub async fn sample_active(
        &self,
        count: usize,
        filter: PeerFilter,
    ) -> Result<Vec<PeerRecord>, SeederError> {
        self.request(|reply| Command::SampleActive {
            count,
            filter,
            reply,
        })
        .await
    }

    pub async fn candidates_for_crawl(
        &self,
        count: usize,
        exclude: HashSet<SocketAddr>,
    ) -> Result<Vec<SocketAddr>, SeederError> {
        self.request(|reply| Command::Candidates {
            count,
            exclude,
            reply,
        })
        .await
    }

    pub async fn next_eligible_in(
        &self,
        exclude: HashSet<SocketAddr>,
    ) -> Result<Option<Duration>, SeederError> {
        self.request(|reply| Command::NextEligible { exclude, reply })
            .await
    }

    pub async fn stats(&self) -> Result<RegistryStats, SeederError> {
        self.request(Command::Stats).await
    }

    /// Writes a snapshot now. `None` if there is no store or the write failed.
    pub async fn persist(&self) -> Result<Option<usize>, SeederError> {
        self.request(Command::Persist).await
    }

    /// Persists and stops the registry task.
    pub async fn shutdown(&self) -> Result<(), SeederError> {
        self.request(Command::Shutdown).await
    }
}
