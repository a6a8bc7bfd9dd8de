//! The top level service tying registry, crawler and DNS responder together.

use crate::builder::SeederConfig;
use crate::connection::TcpConnector;
use crate::dns::DnsResponder;
use crate::events::{EventSink, SeederEvent};
use crate::registry::{self, PeerRecord, PeerRegistry, PeerSource, RegistryHandle, SnapshotStore};
use crate::scheduler::{CrawlScheduler, DnsSeedResolver};
use crate::shutdown;
use crate::SeederError;
use log::{info, warn};
use std::future::Future;

/// A bitcoin DNS seeder.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use bitcoin::Network;
/// use bitcoin_seeder::events::EventSink;
/// use bitcoin_seeder::{Seeder, SeederBuilder};
///
/// let config = SeederBuilder::new(Network::Bitcoin)
///     .with_dns_domain("seed.example.com")?
///     .build()?;
/// Seeder::new(config, EventSink::disabled())
///     .run(async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Seeder {
    config: SeederConfig,
    events: EventSink,
}

impl Seeder {
    pub fn new(config: SeederConfig, events: EventSink) -> Self {
        Seeder { config, events }
    }

    pub fn config(&self) -> &SeederConfig {
        &self.config
    }

    /// Crawls and serves until `shutdown` resolves or a fatal error occurs.
    ///
    /// The registry is persisted on the way out in both cases.
    pub async fn run<F>(self, shutdown: F) -> Result<(), SeederError>
    where
        F: Future<Output = ()>,
    {
        let store = self.config.snapshot_path.clone().map(SnapshotStore::new);
        let records = match &store {
            Some(store) => self.load_snapshot(store).await,
            None => Vec::new(),
        };
        let peers = PeerRegistry::from_records(self.config.registry.clone(), records);
        let (handle, registry_task) = registry::spawn(
            peers,
            store,
            self.config.flush_interval,
            self.events.clone(),
        );

        let result = self.serve(&handle, shutdown).await;

        if let Err(err) = handle.shutdown().await {
            warn!("Registry could not be persisted: {err}");
        }
        if let Err(err) = registry_task.await {
            warn!("Registry task failed: {err}");
        }
        info!("Seeder stopped");
        result
    }

    /// Starts from an empty registry if the snapshot is unreadable.
    async fn load_snapshot(&self, store: &SnapshotStore) -> Vec<PeerRecord> {
        let path = store.path().display().to_string();
        match store.load().await {
            Ok(records) => {
                self.events.emit(SeederEvent::SnapshotLoaded {
                    path,
                    peers: records.len(),
                });
                records
            }
            Err(err) => {
                self.events.emit(SeederEvent::SnapshotFailed {
                    path,
                    error: err.to_string(),
                });
                Vec::new()
            }
        }
    }

    async fn serve<F>(&self, handle: &RegistryHandle, shutdown: F) -> Result<(), SeederError>
    where
        F: Future<Output = ()>,
    {
        for peer in &self.config.manual_peers {
            handle.upsert(*peer, PeerSource::Manual).await?;
        }
        for peer in &self.config.banned_peers {
            handle.ban(*peer).await?;
        }

        let socket = DnsResponder::bind(self.config.dns.bind).await?;
        let (trigger, signal) = shutdown::channel();

        let responder =
            DnsResponder::new(handle.clone(), self.config.dns.clone(), self.events.clone());
        let responder_task = tokio::spawn(responder.serve(socket, signal.clone()));

        let connector = TcpConnector::new(self.config.network)
            .with_connect_timeout(self.config.worker.connect_timeout);
        let resolver = DnsSeedResolver::new(self.config.seed_host.clone(), self.config.seed_port);
        let scheduler = CrawlScheduler::new(
            handle.clone(),
            connector,
            resolver,
            self.config.worker.clone(),
            self.config.scheduler.clone(),
            self.events.clone(),
        );
        let mut scheduler_task = tokio::spawn(scheduler.run(signal));

        tokio::pin!(shutdown);
        let scheduled = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                trigger.trigger();
                scheduler_task.await
            }
            joined = &mut scheduler_task => {
                trigger.trigger();
                joined
            }
        };
        if let Err(err) = responder_task.await {
            warn!("DNS responder task failed: {err}");
        }
        scheduled?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PeerStatus, SnapshotStore};
    use crate::SeederBuilder;
    use bitcoin::Network;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::{TcpListener, UdpSocket};

    /// A local port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn builder(snapshot: &std::path::Path, port: u16) -> SeederBuilder {
        SeederBuilder::new(Network::Regtest)
            .with_dns_domain("seed.example.com")
            .unwrap()
            .with_dns_bind("127.0.0.1:0".parse().unwrap())
            .with_seed("localhost", port)
            .with_snapshot_path(Some(snapshot.to_path_buf()))
            .with_flush_interval(None)
            .with_connect_timeout(Duration::from_millis(200))
            .with_shutdown_grace(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_run_persists_manual_and_banned_peers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let port = closed_port().await;
        let manual = SocketAddr::from(([127, 0, 0, 1], port));
        let banned: SocketAddr = "192.0.2.7:8333".parse().unwrap();
        let config = builder(&path, port)
            .with_manual_peers([manual])
            .with_banned_peers([banned])
            .build()
            .unwrap();

        Seeder::new(config, EventSink::disabled())
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        let records = SnapshotStore::new(&path).load().await.unwrap();
        let manual = records.iter().find(|r| r.address == manual).unwrap();
        assert_eq!(manual.source, PeerSource::Manual);
        let banned = records.iter().find(|r| r.address == banned).unwrap();
        assert_eq!(banned.status, PeerStatus::Banned);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let banned: SocketAddr = "192.0.2.8:8333".parse().unwrap();
        let config = builder(&path, closed_port().await)
            .with_banned_peers([banned])
            .build()
            .unwrap();
        let (events, mut rx) = EventSink::channel(64);

        Seeder::new(config, events)
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(SeederEvent::SnapshotFailed { .. })
        ));
        // Overwritten with a readable snapshot on the way out.
        let records = SnapshotStore::new(&path).load().await.unwrap();
        assert!(records
            .iter()
            .any(|r| r.address == banned && r.status == PeerStatus::Banned));
    }

    #[tokio::test]
    async fn test_dns_bind_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = builder(&dir.path().join("peers.json"), closed_port().await)
            .with_dns_bind(taken.local_addr().unwrap())
            .build()
            .unwrap();

        let result = Seeder::new(config, EventSink::disabled())
            .run(std::future::pending())
            .await;
        assert!(matches!(result, Err(SeederError::DnsBind { .. })));
    }
}
