//! UDP front end answering A queries from registry samples.

use super::wire::{self, Query, ResponseCode, CLASS_IN, MAX_DATAGRAM_SIZE, TYPE_A};
use super::DnsConfig;
use crate::events::{EventSink, SeederEvent};
use crate::registry::RegistryHandle;
use crate::shutdown::ShutdownSignal;
use crate::SeederError;
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

/// Answers DNS queries. Cheap to clone, every clone shares the registry.
#[derive(Debug, Clone)]
pub struct DnsResponder {
    registry: RegistryHandle,
    config: Arc<DnsConfig>,
    events: EventSink,
}

impl DnsResponder {
    pub fn new(registry: RegistryHandle, config: DnsConfig, events: EventSink) -> Self {
        DnsResponder {
            registry,
            config: Arc::new(config),
            events,
        }
    }

    /// Binds the UDP socket for [`DnsResponder::serve`].
    pub async fn bind(address: SocketAddr) -> Result<UdpSocket, SeederError> {
        UdpSocket::bind(address)
            .await
            .map_err(|error| SeederError::DnsBind { address, error })
    }

    /// Builds the reply to one datagram, `None` if it should be dropped.
    ///
    /// Never fails: every problem maps to a DNS response code or a drop.
    pub async fn answer(&self, datagram: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let query = match wire::parse_query(datagram) {
            Ok(query) => query,
            Err(err) => {
                self.events.emit(SeederEvent::DnsMalformed {
                    client,
                    error: err.to_string(),
                });
                return None;
            }
        };

        if query.opcode != 0 || query.qtype != TYPE_A || query.qclass != CLASS_IN {
            return Some(self.reject(&query, client, ResponseCode::NotImplemented));
        }
        let Some(filter) = self.config.filter_for(&query.name) else {
            return Some(self.reject(&query, client, ResponseCode::NameError));
        };
        let records = match self
            .registry
            .sample_active(self.config.max_answers, filter)
            .await
        {
            Ok(records) => records,
            Err(_) => return Some(self.reject(&query, client, ResponseCode::ServerFailure)),
        };

        let answers: Vec<Ipv4Addr> = records
            .iter()
            .filter_map(|record| match record.address.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .collect();
        self.events.emit(SeederEvent::DnsAnswered {
            client,
            name: query.name.clone(),
            answers: answers.len(),
        });
        Some(wire::encode_response(
            &query,
            ResponseCode::NoError,
            &answers,
            self.config.ttl,
        ))
    }

    fn reject(&self, query: &Query, client: SocketAddr, rcode: ResponseCode) -> Vec<u8> {
        self.events.emit(SeederEvent::DnsRejected {
            client,
            name: query.name.clone(),
            rcode: rcode as u8,
        });
        wire::encode_response(query, rcode, &[], self.config.ttl)
    }

    /// Answers datagrams on `socket` until `shutdown` fires.
    ///
    /// Each datagram is answered on its own task so a slow registry reply
    /// never holds up the receive loop. At most `max_pending_queries` are
    /// answered at once, datagrams arriving beyond that are dropped.
    pub async fn serve(self, socket: UdpSocket, mut shutdown: ShutdownSignal) {
        let socket = Arc::new(socket);
        let pending = Arc::new(Semaphore::new(self.config.max_pending_queries));
        match socket.local_addr() {
            Ok(address) => info!("DNS responder for {} listening on {address}", self.config.domain),
            Err(_) => info!("DNS responder for {} listening", self.config.domain),
        }

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, client) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            debug!("DNS receive failed: {err}");
                            continue;
                        }
                    };
                    let Ok(permit) = pending.clone().try_acquire_owned() else {
                        debug!("Dropping DNS query from {client}, too many pending");
                        continue;
                    };
                    let datagram = buf[..len].to_vec();
                    let responder = self.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Some(response) = responder.answer(&datagram, client).await {
                            if let Err(err) = socket.send_to(&response, client).await {
                                debug!("DNS reply to {client} failed: {err}");
                            }
                        }
                    });
                }
            }
        }
        info!("DNS responder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::wire::test_utils::{query, query_in_class};
    use crate::dns::wire::HEADER_LEN;
    use crate::registry::{self, PeerRegistry, PeerSource, RegistryPolicy};
    use crate::shutdown;
    use bitcoin::p2p::ServiceFlags;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::timeout;

    const CLIENT: &str = "192.0.2.1:5353";

    fn responder(good: &[(SocketAddr, ServiceFlags)]) -> DnsResponder {
        responder_with(good, DnsConfig::new("seed.example.com").unwrap())
    }

    fn responder_with(good: &[(SocketAddr, ServiceFlags)], config: DnsConfig) -> DnsResponder {
        let now = registry::now();
        let mut peers = PeerRegistry::new(RegistryPolicy::default());
        for (address, services) in good {
            peers.upsert(*address, PeerSource::Gossip, ServiceFlags::NONE, now);
            peers.record_success(address, *services, now);
        }
        // Known but never reached, must never be served.
        peers.upsert("10.9.9.9:8333".parse().unwrap(), PeerSource::Gossip, ServiceFlags::NONE, now);
        let (handle, _) = registry::spawn(peers, None, None, EventSink::disabled());
        DnsResponder::new(handle, config, EventSink::disabled())
    }

    fn good_peers(count: u8) -> Vec<(SocketAddr, ServiceFlags)> {
        (1..=count)
            .map(|i| (SocketAddr::from(([10, 0, 0, i], 8333)), ServiceFlags::NETWORK))
            .collect()
    }

    fn answers(response: &[u8], request_len: usize) -> Vec<Ipv4Addr> {
        let count = u16::from_be_bytes([response[6], response[7]]) as usize;
        (0..count)
            .map(|i| {
                let rdata = request_len + i * 16 + 12;
                Ipv4Addr::new(
                    response[rdata],
                    response[rdata + 1],
                    response[rdata + 2],
                    response[rdata + 3],
                )
            })
            .collect()
    }

    fn rcode(response: &[u8]) -> u8 {
        response[3] & 0x0f
    }

    #[tokio::test]
    async fn test_answers_from_good_peers() {
        let good = good_peers(3);
        let responder = responder(&good);
        let request = query(0x4242, 0x0100, "seed.example.com", TYPE_A);

        let response = responder
            .answer(&request, CLIENT.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(&response[0..2], &[0x42, 0x42]);
        assert_eq!(rcode(&response), 0);
        // Authoritative.
        assert_ne!(response[2] & 0x04, 0);
        assert_eq!(&response[HEADER_LEN..request.len()], &request[HEADER_LEN..]);

        let served: HashSet<_> = answers(&response, request.len()).into_iter().collect();
        let expected: HashSet<_> = good
            .iter()
            .map(|(address, _)| match address.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => unreachable!(),
            })
            .collect();
        assert_eq!(served, expected);
    }

    #[tokio::test]
    async fn test_answer_count_is_capped() {
        let responder = responder(&good_peers(30));
        let request = query(1, 0, "seed.example.com", TYPE_A);
        let response = responder
            .answer(&request, CLIENT.parse().unwrap())
            .await
            .unwrap();

        let served = answers(&response, request.len());
        assert_eq!(served.len(), 10);
        assert_eq!(served.iter().collect::<HashSet<_>>().len(), 10);
    }

    #[tokio::test]
    async fn test_empty_registry_answers_nothing() {
        let responder = responder(&[]);
        let request = query(1, 0, "seed.example.com", TYPE_A);
        let response = responder
            .answer(&request, CLIENT.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(rcode(&response), 0);
        assert_eq!(&response[6..8], &[0, 0]);
    }

    #[tokio::test]
    async fn test_unsupported_type_is_not_implemented() {
        let responder = responder(&good_peers(3));
        // MX.
        let request = query(9, 0, "seed.example.com", 15);
        let response = responder
            .answer(&request, CLIENT.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(rcode(&response), 4);
        assert_eq!(&response[6..8], &[0, 0]);
    }

    #[tokio::test]
    async fn test_non_internet_class_is_not_implemented() {
        let responder = responder(&good_peers(3));
        // CH and ANY.
        for qclass in [3, 255] {
            let request = query_in_class(9, 0, "seed.example.com", TYPE_A, qclass);
            let response = responder
                .answer(&request, CLIENT.parse().unwrap())
                .await
                .unwrap();
            assert_eq!(rcode(&response), 4);
            assert_eq!(&response[6..8], &[0, 0]);
        }
    }

    #[tokio::test]
    async fn test_foreign_name_is_nxdomain() {
        let responder = responder(&good_peers(3));
        let request = query(9, 0, "example.org", TYPE_A);
        let response = responder
            .answer(&request, CLIENT.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(rcode(&response), 3);
        assert_eq!(&response[6..8], &[0, 0]);
    }

    #[tokio::test]
    async fn test_service_filter_subdomain() {
        let mut good = good_peers(4);
        good[0].1 = ServiceFlags::NETWORK | ServiceFlags::COMPACT_FILTERS;
        let responder = responder(&good);
        // NODE_COMPACT_FILTERS is bit 6.
        let request = query(3, 0, "x40.seed.example.com", TYPE_A);
        let response = responder
            .answer(&request, CLIENT.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(answers(&response, request.len()), vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[tokio::test]
    async fn test_drops_responses_and_garbage() {
        let responder = responder(&good_peers(1));
        let client = CLIENT.parse().unwrap();
        assert!(responder
            .answer(&query(1, 0x8000, "seed.example.com", TYPE_A), client)
            .await
            .is_none());
        assert!(responder.answer(&[0xff; 7], client).await.is_none());
    }

    #[tokio::test]
    async fn test_registry_gone_is_servfail() {
        let (handle, join) = registry::spawn(
            PeerRegistry::new(RegistryPolicy::default()),
            None,
            None,
            EventSink::disabled(),
        );
        handle.shutdown().await.unwrap();
        join.await.unwrap();

        let responder = DnsResponder::new(
            handle,
            DnsConfig::new("seed.example.com").unwrap(),
            EventSink::disabled(),
        );
        let request = query(1, 0, "seed.example.com", TYPE_A);
        let response = responder
            .answer(&request, CLIENT.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(rcode(&response), 2);
    }

    #[tokio::test]
    async fn test_serves_after_flood() {
        let config = DnsConfig {
            max_pending_queries: 1,
            ..DnsConfig::new("seed.example.com").unwrap()
        };
        let responder = responder_with(&good_peers(3), config);
        let socket = DnsResponder::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server = socket.local_addr().unwrap();
        let (trigger, signal) = shutdown::channel();
        let serving = tokio::spawn(responder.serve(socket, signal));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for id in 0..200u16 {
            let request = query(id, 0, "seed.example.com", TYPE_A);
            client.send_to(&request, server).await.unwrap();
        }
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut flood_answers = 0;
        while let Ok(Ok(_)) =
            timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await
        {
            flood_answers += 1;
        }
        assert!(flood_answers >= 1);

        let request = query(0x7777, 0, "seed.example.com", TYPE_A);
        client.send_to(&request, server).await.unwrap();
        // Skip any straggling flood replies.
        let len = loop {
            let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if buf[0..2] == [0x77, 0x77] {
                break len;
            }
        };
        assert_eq!(rcode(&buf[..len]), 0);
        assert_eq!(answers(&buf[..len], request.len()).len(), 3);

        trigger.trigger();
        timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
    }
}
