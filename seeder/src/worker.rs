//! A single crawl of a single peer.
//!
//! A worker connects, performs the version handshake, asks for addresses and
//! reports exactly one [`CrawlOutcome`]. It never touches the registry, the
//! scheduler applies outcomes. Every network operation is bounded by a
//! timeout so a worker always terminates.
//!
//! ```text
//! Connecting -> Handshaking -> Established -> AwaitingAddr -> Done
//!      \              \              \              \
//!       `--------------`--------------`--------------`--> Failed
//! ```

use crate::connection::{Connector, PeerConnection};
use crate::registry;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin_seeder_connection::{
    generate_nonce, version_message, AdvertisedPeer, ConnectionConfiguration, ConnectionError,
    ADDRV2_MIN_PROTOCOL_VERSION, DEFAULT_CONNECTION_TIMEOUT, MIN_PROTOCOL_VERSION,
};
use log::trace;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};

/// Default time to complete the version handshake once connected.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
/// Default time to wait for `addr` replies after sending `getaddr`.
pub const DEFAULT_ADDR_TIMEOUT: Duration = Duration::from_secs(20);
/// Default silence after an `addr` batch which ends collection early.
pub const DEFAULT_ADDR_QUIET_PERIOD: Duration = Duration::from_secs(5);
/// Default time allowed for a single message write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default cap on addresses taken from one peer.
pub const DEFAULT_MAX_ADDRESSES: usize = 1000;

/// Settings shared by all workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How we present ourselves in the handshake.
    pub connection: ConnectionConfiguration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub addr_timeout: Duration,
    pub addr_quiet_period: Duration,
    pub write_timeout: Duration,
    pub max_addresses: usize,
    /// Send `getaddr` after the handshake. Without it a crawl only checks
    /// reachability.
    pub request_addresses: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            connection: ConnectionConfiguration::default(),
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            addr_timeout: DEFAULT_ADDR_TIMEOUT,
            addr_quiet_period: DEFAULT_ADDR_QUIET_PERIOD,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_addresses: DEFAULT_MAX_ADDRESSES,
            request_addresses: true,
        }
    }
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Handshaking,
    Established,
    AwaitingAddr,
    Done,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Connecting => "connecting",
            WorkerState::Handshaking => "handshaking",
            WorkerState::Established => "established",
            WorkerState::AwaitingAddr => "awaiting addr",
            WorkerState::Done => "done",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a crawl failed, other than running out of time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The TCP connection could not be opened.
    Connect(String),
    /// The connection broke after it was opened.
    Io(String),
    /// Bytes on the wire were not a valid message for our network.
    Malformed(String),
    /// A message the current state does not allow.
    UnexpectedMessage { state: WorkerState, command: String },
    /// The peer sent a second version message.
    DuplicateVersion,
    /// The peer echoed our own nonce, we connected to ourselves.
    ConnectionLoop,
    /// The peer speaks a protocol version older than we support.
    ObsoleteVersion(u32),
}

impl FailureReason {
    /// True for misbehaviour, as opposed to the peer simply being unreachable.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FailureReason::Malformed(_)
                | FailureReason::UnexpectedMessage { .. }
                | FailureReason::DuplicateVersion
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Connect(err) => write!(f, "connect failed: {err}"),
            FailureReason::Io(err) => write!(f, "connection lost: {err}"),
            FailureReason::Malformed(err) => write!(f, "malformed message: {err}"),
            FailureReason::UnexpectedMessage { state, command } => {
                write!(f, "unexpected {command} while {state}")
            }
            FailureReason::DuplicateVersion => write!(f, "duplicate version message"),
            FailureReason::ConnectionLoop => write!(f, "connected to ourselves"),
            FailureReason::ObsoleteVersion(version) => {
                write!(f, "obsolete protocol version {version}")
            }
        }
    }
}

/// What a successful crawl learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReport {
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: i32,
    /// Distinct IP addresses the peer advertised, possibly empty.
    pub advertised: Vec<AdvertisedPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlResult {
    Success(PeerReport),
    Failure(FailureReason),
    /// A bounded wait expired in the given state.
    Timeout(WorkerState),
}

/// The single result of crawling `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlOutcome {
    pub address: SocketAddr,
    pub result: CrawlResult,
    /// Unix seconds.
    pub finished_at: u64,
}

/// Crawls `address` once.
pub async fn crawl<C: Connector>(
    connector: &C,
    address: SocketAddr,
    config: &WorkerConfig,
) -> CrawlOutcome {
    Worker::new(address, config, generate_nonce())
        .run(connector)
        .await
}

enum Abort {
    Timeout,
    Failed(FailureReason),
}

impl From<ConnectionError> for Abort {
    fn from(err: ConnectionError) -> Self {
        if err.is_protocol_violation() {
            Abort::Failed(FailureReason::Malformed(err.to_string()))
        } else {
            Abort::Failed(FailureReason::Io(err.to_string()))
        }
    }
}

struct Worker<'a> {
    address: SocketAddr,
    config: &'a WorkerConfig,
    /// Our version nonce, for connection loop detection.
    nonce: u64,
    state: WorkerState,
}

impl<'a> Worker<'a> {
    fn new(address: SocketAddr, config: &'a WorkerConfig, nonce: u64) -> Self {
        Worker {
            address,
            config,
            nonce,
            state: WorkerState::Connecting,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        trace!("{}: {} -> {}", self.address, self.state, next);
        self.state = next;
    }

    async fn run<C: Connector>(mut self, connector: &C) -> CrawlOutcome {
        let result = match self.connect(connector).await {
            Ok(mut connection) => self.session(&mut connection).await,
            Err(abort) => Err(abort),
        };
        let result = match result {
            Ok(report) => {
                self.transition(WorkerState::Done);
                CrawlResult::Success(report)
            }
            Err(Abort::Timeout) => {
                let stage = self.state;
                self.transition(WorkerState::Failed);
                CrawlResult::Timeout(stage)
            }
            Err(Abort::Failed(reason)) => {
                self.transition(WorkerState::Failed);
                CrawlResult::Failure(reason)
            }
        };
        CrawlOutcome {
            address: self.address,
            result,
            finished_at: registry::now(),
        }
    }

    async fn connect<C: Connector>(&mut self, connector: &C) -> Result<C::Connection, Abort> {
        match timeout(self.config.connect_timeout, connector.connect(self.address)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(ConnectionError::Io(err))) if err.kind() == io::ErrorKind::TimedOut => {
                Err(Abort::Timeout)
            }
            Ok(Err(err)) => Err(Abort::Failed(FailureReason::Connect(err.to_string()))),
            Err(_) => Err(Abort::Timeout),
        }
    }

    async fn session<P: PeerConnection>(&mut self, connection: &mut P) -> Result<PeerReport, Abort> {
        self.transition(WorkerState::Handshaking);
        let peer = self.handshake(connection).await?;
        self.transition(WorkerState::Established);

        let advertised = if self.config.request_addresses {
            self.transition(WorkerState::AwaitingAddr);
            self.collect_addresses(connection).await?
        } else {
            Vec::new()
        };

        Ok(PeerReport {
            version: peer.version,
            services: peer.services,
            user_agent: peer.user_agent,
            start_height: peer.start_height,
            advertised,
        })
    }

    /// Drives the handshake until the peer's verack.
    ///
    /// We answer the peer's version with verack right away, preceded by
    /// `sendaddrv2` when both sides speak BIP-155.
    async fn handshake<P: PeerConnection>(
        &mut self,
        connection: &mut P,
    ) -> Result<VersionMessage, Abort> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let ours = version_message(&self.config.connection, self.address, self.nonce);
        self.send(connection, ours).await?;

        let mut peer_version: Option<VersionMessage> = None;
        loop {
            let message = receive_before(connection, deadline).await?;
            let accepted = peer_version.is_some();
            match message {
                NetworkMessage::Version(_) if accepted => {
                    return Err(Abort::Failed(FailureReason::DuplicateVersion))
                }
                NetworkMessage::Version(version) => {
                    if version.nonce == self.nonce {
                        return Err(Abort::Failed(FailureReason::ConnectionLoop));
                    }
                    if version.version < MIN_PROTOCOL_VERSION {
                        return Err(Abort::Failed(FailureReason::ObsoleteVersion(
                            version.version,
                        )));
                    }
                    let negotiated = version.version.min(self.config.connection.protocol_version);
                    if self.config.connection.enable_addrv2
                        && negotiated >= ADDRV2_MIN_PROTOCOL_VERSION
                    {
                        self.send(connection, NetworkMessage::SendAddrV2).await?;
                    }
                    self.send(connection, NetworkMessage::Verack).await?;
                    peer_version = Some(version);
                }
                NetworkMessage::Verack => {
                    return peer_version.ok_or_else(|| self.unexpected("verack"));
                }
                ref other if !accepted => return Err(self.unexpected(other.cmd())),
                NetworkMessage::SendAddrV2
                | NetworkMessage::WtxidRelay
                | NetworkMessage::SendHeaders
                | NetworkMessage::SendCmpct(_)
                | NetworkMessage::FeeFilter(_)
                | NetworkMessage::Ping(_) => {
                    trace!("Ignoring {} from {} during handshake", message.cmd(), self.address)
                }
                ref other => return Err(self.unexpected(other.cmd())),
            }
        }
    }

    /// Sends `getaddr` and gathers replies.
    ///
    /// Collection ends at the address cap, when the overall timeout expires,
    /// or when the peer goes quiet after a multi-entry reply. A single entry
    /// is usually the peer announcing itself, so it does not start the quiet
    /// period.
    ///
    /// Running out of time here is not a failure: the peer already completed
    /// the handshake, so whatever was collected is returned as a success.
    async fn collect_addresses<P: PeerConnection>(
        &mut self,
        connection: &mut P,
    ) -> Result<Vec<AdvertisedPeer>, Abort> {
        self.send(connection, NetworkMessage::GetAddr).await?;
        let deadline = Instant::now() + self.config.addr_timeout;
        let mut quiet_deadline: Option<Instant> = None;
        let mut seen = HashSet::new();
        let mut collected = Vec::new();

        while collected.len() < self.config.max_addresses {
            let wait_until = quiet_deadline.map_or(deadline, |quiet| quiet.min(deadline));
            let message = match receive_before(connection, wait_until).await {
                Ok(message) => message,
                Err(Abort::Timeout) => break,
                Err(abort) => return Err(abort),
            };

            let (entries, batch): (usize, Vec<AdvertisedPeer>) = match message {
                NetworkMessage::Addr(entries) => (
                    entries.len(),
                    entries
                        .iter()
                        .filter_map(|(_, address)| AdvertisedPeer::from_address(address))
                        .collect(),
                ),
                NetworkMessage::AddrV2(entries) => (
                    entries.len(),
                    entries
                        .iter()
                        .filter_map(AdvertisedPeer::from_addr_v2)
                        .collect(),
                ),
                NetworkMessage::Ping(nonce) => {
                    self.send(connection, NetworkMessage::Pong(nonce)).await?;
                    continue;
                }
                other => {
                    trace!("Ignoring {} from {} while awaiting addr", other.cmd(), self.address);
                    continue;
                }
            };
            trace!("{} advertised {} addresses", self.address, entries);

            if entries > 1 {
                quiet_deadline = Some(Instant::now() + self.config.addr_quiet_period);
            }
            for peer in batch {
                if collected.len() >= self.config.max_addresses {
                    break;
                }
                if seen.insert(peer.address) {
                    collected.push(peer);
                }
            }
        }
        Ok(collected)
    }

    async fn send<P: PeerConnection>(
        &self,
        connection: &mut P,
        message: NetworkMessage,
    ) -> Result<(), Abort> {
        match timeout(self.config.write_timeout, connection.send(message)).await {
            Ok(result) => result.map_err(Abort::from),
            Err(_) => Err(Abort::Timeout),
        }
    }

    fn unexpected(&self, command: &str) -> Abort {
        Abort::Failed(FailureReason::UnexpectedMessage {
            state: self.state,
            command: command.to_string(),
        })
    }
}

async fn receive_before<P: PeerConnection>(
    connection: &mut P,
    deadline: Instant,
) -> Result<NetworkMessage, Abort> {
    match timeout_at(deadline, connection.receive()).await {
        Ok(result) => result.map_err(Abort::from),
        Err(_) => Err(Abort::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_utils::{peer_version, MockConnector, MockPeerConnection};
    use bitcoin::p2p::address::{AddrV2, AddrV2Message};
    use bitcoin_seeder_connection::TransportError;
    use std::net::Ipv4Addr;

    const NONCE: u64 = 0xDEAD_BEEF;

    fn target() -> SocketAddr {
        "10.0.0.1:8333".parse().unwrap()
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            connect_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(200),
            addr_timeout: Duration::from_millis(300),
            addr_quiet_period: Duration::from_millis(50),
            write_timeout: Duration::from_millis(200),
            ..WorkerConfig::default()
        }
    }

    async fn run(connection: MockPeerConnection, config: &WorkerConfig) -> CrawlResult {
        let connector = MockConnector::new();
        connector.add_connection(target(), connection);
        Worker::new(target(), config, NONCE)
            .run(&connector)
            .await
            .result
    }

    fn gossip(count: u8) -> Vec<(SocketAddr, ServiceFlags)> {
        (1..=count)
            .map(|i| (SocketAddr::from(([192, 168, 0, i], 8333)), ServiceFlags::NETWORK))
            .collect()
    }

    #[tokio::test]
    async fn test_successful_crawl() {
        let mut connection = MockPeerConnection::handshaking(peer_version(1));
        connection.add_addr_message(&gossip(2));
        let sent = connection.sent();

        let result = run(connection, &fast_config()).await;
        let CrawlResult::Success(report) = result else {
            panic!("Expected success, got {result:?}");
        };
        assert_eq!(report.version, 70016);
        assert_eq!(report.user_agent, "/Satoshi:27.0.0/");
        assert!(report.services.has(ServiceFlags::WITNESS));
        assert_eq!(report.advertised.len(), 2);
        assert!(report.advertised[0].services.has(ServiceFlags::NETWORK));

        let sent = sent.lock().unwrap();
        let commands: Vec<_> = sent.iter().map(|message| message.cmd()).collect();
        assert_eq!(commands, vec!["version", "sendaddrv2", "verack", "getaddr"]);
        match &sent[0] {
            NetworkMessage::Version(version) => {
                assert_eq!(version.nonce, NONCE);
                assert_eq!(version.services, ServiceFlags::NONE);
            }
            other => panic!("Expected version, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_addr_reply_is_success() {
        let connection = MockPeerConnection::handshaking(peer_version(1));
        let result = run(connection, &fast_config()).await;
        assert!(
            matches!(&result, CrawlResult::Success(report) if report.advertised.is_empty()),
            "Got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_addr_timeout_keeps_collected() {
        // A lone entry does not start the quiet period, so only the overall
        // timeout ends collection.
        let mut connection = MockPeerConnection::handshaking(peer_version(1));
        connection.add_addr_message(&gossip(1));
        let result = run(connection, &fast_config()).await;
        assert!(
            matches!(&result, CrawlResult::Success(report) if report.advertised.len() == 1),
            "Got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_in_handshake() {
        let result = run(MockPeerConnection::new(), &fast_config()).await;
        assert_eq!(result, CrawlResult::Timeout(WorkerState::Handshaking));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = MockConnector::new();
        let outcome = crawl(&connector, target(), &fast_config()).await;
        assert_eq!(outcome.address, target());
        assert!(matches!(
            outcome.result,
            CrawlResult::Failure(FailureReason::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_loop() {
        let connection = MockPeerConnection::handshaking(peer_version(NONCE));
        let result = run(connection, &fast_config()).await;
        assert_eq!(result, CrawlResult::Failure(FailureReason::ConnectionLoop));
    }

    #[tokio::test]
    async fn test_obsolete_version() {
        let mut version = peer_version(1);
        version.version = 60002;
        let connection = MockPeerConnection::handshaking(version);
        let result = run(connection, &fast_config()).await;
        assert_eq!(
            result,
            CrawlResult::Failure(FailureReason::ObsoleteVersion(60002))
        );
    }

    #[tokio::test]
    async fn test_duplicate_version() {
        let mut connection = MockPeerConnection::new();
        connection.add_incoming_message(NetworkMessage::Version(peer_version(1)));
        connection.add_incoming_message(NetworkMessage::Version(peer_version(1)));
        let result = run(connection, &fast_config()).await;
        assert_eq!(result, CrawlResult::Failure(FailureReason::DuplicateVersion));
        assert!(FailureReason::DuplicateVersion.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_message_before_version() {
        let mut connection = MockPeerConnection::new();
        connection.add_incoming_message(NetworkMessage::GetAddr);
        let result = run(connection, &fast_config()).await;
        assert_eq!(
            result,
            CrawlResult::Failure(FailureReason::UnexpectedMessage {
                state: WorkerState::Handshaking,
                command: "getaddr".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_tolerated_handshake_extras() {
        let mut connection = MockPeerConnection::new();
        connection.add_incoming_message(NetworkMessage::Version(peer_version(1)));
        connection.add_incoming_message(NetworkMessage::WtxidRelay);
        connection.add_incoming_message(NetworkMessage::SendAddrV2);
        connection.add_incoming_message(NetworkMessage::Ping(5));
        connection.add_incoming_message(NetworkMessage::Verack);
        let result = run(connection, &fast_config()).await;
        assert!(matches!(result, CrawlResult::Success(_)), "Got {result:?}");
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let mut connection = MockPeerConnection::new();
        connection.add_incoming_error(ConnectionError::TransportFailed(
            TransportError::MagicMismatch,
        ));
        let result = run(connection, &fast_config()).await;
        let CrawlResult::Failure(reason) = result else {
            panic!("Expected failure, got {result:?}");
        };
        assert!(matches!(reason, FailureReason::Malformed(_)));
        assert!(reason.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_disconnect_while_awaiting_addr() {
        let mut connection = MockPeerConnection::handshaking(peer_version(1));
        connection.add_incoming_error(ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));
        let result = run(connection, &fast_config()).await;
        assert!(matches!(
            result,
            CrawlResult::Failure(FailureReason::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_answered_while_awaiting_addr() {
        let mut connection = MockPeerConnection::handshaking(peer_version(1));
        connection.add_incoming_message(NetworkMessage::Ping(77));
        connection.add_addr_message(&gossip(3));
        let sent = connection.sent();

        let result = run(connection, &fast_config()).await;
        assert!(matches!(&result, CrawlResult::Success(report) if report.advertised.len() == 3));
        assert!(sent
            .lock()
            .unwrap()
            .iter()
            .any(|message| matches!(message, NetworkMessage::Pong(77))));
    }

    #[tokio::test]
    async fn test_address_cap_and_dedup() {
        let mut connection = MockPeerConnection::handshaking(peer_version(1));
        connection.add_addr_message(&gossip(3));
        connection.add_addr_message(&gossip(10));
        let config = WorkerConfig {
            max_addresses: 5,
            ..fast_config()
        };

        let result = run(connection, &config).await;
        let CrawlResult::Success(report) = result else {
            panic!("Expected success, got {result:?}");
        };
        let expected: Vec<SocketAddr> = gossip(5).into_iter().map(|(address, _)| address).collect();
        let advertised: Vec<SocketAddr> = report.advertised.iter().map(|peer| peer.address).collect();
        assert_eq!(advertised, expected);
    }

    #[tokio::test]
    async fn test_addrv2_skips_non_ip() {
        let mut connection = MockPeerConnection::handshaking(peer_version(1));
        connection.add_incoming_message(NetworkMessage::AddrV2(vec![
            AddrV2Message {
                time: 0,
                services: ServiceFlags::NETWORK,
                addr: AddrV2::Ipv4(Ipv4Addr::new(1, 2, 3, 4)),
                port: 8333,
            },
            AddrV2Message {
                time: 0,
                services: ServiceFlags::NETWORK,
                addr: AddrV2::TorV3([1u8; 32]),
                port: 8333,
            },
        ]));

        let result = run(connection, &fast_config()).await;
        let CrawlResult::Success(report) = result else {
            panic!("Expected success, got {result:?}");
        };
        assert_eq!(report.advertised.len(), 1);
        assert_eq!(report.advertised[0].address, "1.2.3.4:8333".parse().unwrap());
    }

    #[tokio::test]
    async fn test_no_sendaddrv2_for_old_peers() {
        let mut version = peer_version(1);
        version.version = 70015;
        let connection = MockPeerConnection::handshaking(version);
        let sent = connection.sent();
        let config = WorkerConfig {
            request_addresses: false,
            ..fast_config()
        };

        let result = run(connection, &config).await;
        assert!(matches!(result, CrawlResult::Success(_)));
        let commands: Vec<_> = sent.lock().unwrap().iter().map(|m| m.cmd()).collect();
        assert_eq!(commands, vec!["version", "verack"]);
    }

    #[tokio::test]
    async fn test_write_failure() {
        let mut connection = MockPeerConnection::handshaking(peer_version(1));
        connection.is_closed = true;
        let result = run(connection, &fast_config()).await;
        assert!(matches!(
            result,
            CrawlResult::Failure(FailureReason::Io(_))
        ));
    }
}
