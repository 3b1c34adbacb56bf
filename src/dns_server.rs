use crate::codec;
use crate::config::{Config, ZoneConfig};
use crate::plugin::SharedState;
use crate::types::DnsMessage;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::{JoinHandle, JoinSet};

const MAX_DATAGRAM: usize = 65_535;

pub struct DnsServer {
    config: Arc<Config>,
    shared: Arc<SharedState>,
}

/// A bound UDP socket and the server block that answers on it.
pub struct Listener {
    socket: UdpSocket,
    zone_idx: usize,
    port: u16,
}

impl Listener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Receive loops of a started server.
#[derive(Default)]
pub struct RunningServer {
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Cancels every receive loop and waits until each one has dropped its
    /// socket, so the ports can be bound again as soon as this returns.
    pub async fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("Listener task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl DnsServer {
    pub fn new(config: Config, shared: Arc<SharedState>) -> Result<Self> {
        Ok(Self { config: Arc::new(config), shared })
    }

    pub fn shared(&self) -> &Arc<SharedState> { &self.shared }

    /// Binds one UDP socket per distinct port. Failing to bind any of them is
    /// fatal: the server never runs with a listener missing.
    pub async fn bind(&self, default_address: SocketAddr) -> Result<Vec<Listener>> {
        let mut bind_map: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
        for (i, zone) in self.config.zones.iter().enumerate() {
            let port = zone.port.unwrap_or(default_address.port());
            bind_map.entry(port).or_default().push(i);
        }

        let mut listeners = Vec::new();
        for (port, zone_indices) in bind_map {
            let bind_addr = SocketAddr::new(default_address.ip(), port);
            let socket = UdpSocket::bind(bind_addr).await
                .with_context(|| format!("Failed to bind UDP {}", bind_addr))?;
            let zone_idx = zone_indices[0];
            if zone_indices.len() > 1 {
                tracing::warn!(
                    "{} server blocks share port {}, only '{}' will answer",
                    zone_indices.len(), port, self.config.zones[zone_idx].name
                );
            }

            let port = socket.local_addr()?.port();
            let listener = Listener { socket, zone_idx, port };
            tracing::info!("DNS server listening on udp://{}", listener.local_addr()?);
            listeners.push(listener);
        }
        Ok(listeners)
    }

    /// Spawns a receive loop per listener. Each loop owns its socket; queries
    /// are handled on a per-loop `JoinSet` and the loop sends the replies, so
    /// aborting the loop closes the socket and cancels its in-flight queries.
    pub fn start(&self, listeners: Vec<Listener>) -> RunningServer {
        let tasks = listeners
            .into_iter()
            .map(|listener| tokio::spawn(receive_loop(self.config.clone(), listener)))
            .collect();
        RunningServer { tasks }
    }
}

async fn receive_loop(config: Arc<Config>, listener: Listener) {
    let Listener { socket, zone_idx, port } = listener;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((size, src)) => {
                    let raw = buf[..size].to_vec();
                    let config = config.clone();
                    in_flight.spawn(async move {
                        let zone = &config.zones[zone_idx];
                        handle_datagram(zone, raw, src, port).await.map(|reply| (reply, src))
                    });
                }
                Err(e) => tracing::warn!("UDP receive failed on port {}: {}", port, e),
            },
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => match done {
                Ok(Some((reply, src))) => {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        tracing::warn!("Failed to send response to {}: {}", src, e);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Query task on port {} failed: {}", port, e),
            },
        }
    }
}

/// Decodes one datagram, runs it through the zone's chain and returns the
/// encoded reply. `None` means nothing is sent back.
pub async fn handle_datagram(zone: &ZoneConfig, raw: Vec<u8>, src: SocketAddr, port: u16) -> Option<Vec<u8>> {
    let query = match codec::decode(&raw) {
        Ok(query) => query,
        Err(e) if e.is_malformed() => {
            tracing::debug!("Dropping malformed datagram ({} bytes) from {}: {}", raw.len(), src, e);
            return None;
        }
        Err(e) => {
            tracing::debug!("Dropping query from {}: {}", src, e);
            return None;
        }
    };

    let mut msg = DnsMessage::new(raw, query, src, port);
    for plugin in &zone.plugins {
        if msg.halt_chain { break; }
        if let Err(e) = plugin.process(&mut msg).await {
            tracing::warn!("[{}] failed for query from {}: {}", plugin.name(), src, e);
        }
    }

    let reply = msg.response.as_ref().map(codec::encode);
    if let Some(bytes) = &reply {
        tracing::debug!(
            "{} byte query on port {:?} answered by {} ({} bytes)",
            msg.raw_query.len(), msg.server_port, msg.answered_by, bytes.len()
        );
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_query, decode_response, HEADER_LEN, MAX_UDP_PAYLOAD};
    use crate::types::RecordType;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const COREFILE: &str = ". {\n log\n policy {\n example.com 192.168.100.10\n }\n}\n";

    fn server() -> DnsServer {
        let shared = Arc::new(SharedState::new(None));
        let config = Config::parse(COREFILE, shared.clone()).unwrap();
        DnsServer::new(config, shared).unwrap()
    }

    fn client() -> SocketAddr { "127.0.0.1:40000".parse().unwrap() }

    async fn ask(server: &DnsServer, raw: Vec<u8>) -> Option<Vec<u8>> {
        handle_datagram(&server.config.zones[0], raw, client(), 53).await
    }

    #[tokio::test]
    async fn allowed_and_blocked_domains() {
        let server = server();

        let reply = ask(&server, build_query(1, &[("example.com", 1)])).await.unwrap();
        let resp = decode_response(&reply).unwrap();
        assert_eq!(resp.answers.len(), 1);
        assert_eq!(resp.answers[0].addr, Ipv4Addr::new(192, 168, 100, 10));
        assert_eq!(resp.answers[0].ttl, 300);
        assert_eq!(resp.answers[0].rtype, RecordType::A);

        let reply = ask(&server, build_query(2, &[("ads.tracker.net", 1)])).await.unwrap();
        let resp = decode_response(&reply).unwrap();
        assert_eq!(resp.answers.len(), 1);
        assert_eq!(resp.answers[0].addr, Ipv4Addr::UNSPECIFIED);
    }

    #[tokio::test]
    async fn reply_echoes_id_and_question_bytes() {
        let server = server();
        let raw = build_query(0x4242, &[("ExAmPlE.CoM", 28)]);
        let reply = ask(&server, raw.clone()).await.unwrap();

        assert_eq!(reply[..2], raw[..2]);
        assert_eq!(reply[4..6], raw[4..6]);
        assert_eq!(reply[HEADER_LEN..raw.len()], raw[HEADER_LEN..]);
        assert_ne!(reply[2] & 0x80, 0);

        let resp = decode_response(&reply).unwrap();
        assert_eq!(resp.answers[0].addr, Ipv4Addr::new(192, 168, 100, 10));
        assert_eq!(resp.answers[0].name.to_string(), "example.com");
        assert_eq!(resp.answers[0].rtype, RecordType::A);
    }

    #[tokio::test]
    async fn pointer_stuffed_multi_question_query_gets_no_reply() {
        let server = server();
        let long = ["a".repeat(60), "b".repeat(60), "c".repeat(60), "d".repeat(60)].join(".");
        let mut raw = build_query(5, &[(long.as_str(), 1)]);
        raw[4..6].copy_from_slice(&42u16.to_be_bytes());
        for _ in 0..41 {
            raw.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
        }
        assert!(ask(&server, raw).await.is_none());
    }

    #[tokio::test]
    async fn long_name_reply_fits_in_a_datagram() {
        let server = server();
        let long = ["a".repeat(60), "b".repeat(60), "c".repeat(60), "d".repeat(60)].join(".");
        let reply = ask(&server, build_query(6, &[(long.as_str(), 1)])).await.unwrap();
        assert!(reply.len() <= MAX_UDP_PAYLOAD);
        assert_ne!(reply[2] & 0x02, 0);
    }

    #[tokio::test]
    async fn drops_garbage_and_empty_queries() {
        let server = server();
        assert!(ask(&server, vec![0x01, 0x02, 0x03]).await.is_none());
        assert!(ask(&server, build_query(9, &[])).await.is_none());
    }

    #[tokio::test]
    async fn serves_over_udp() {
        let server = server();
        let listeners = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listeners[0].local_addr().unwrap();
        let running = server.start(listeners);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = vec![0u8; 512];

        // Garbage gets no reply and does not take the listener down.
        client.send_to(&[0xde, 0xad, 0xbe], addr).await.unwrap();
        let silent = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(silent.is_err());

        client.send_to(&build_query(77, &[("EXAMPLE.com", 1)]), addr).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await.unwrap().unwrap();
        let resp = decode_response(&buf[..n]).unwrap();
        assert_eq!(resp.id, 77);
        assert_eq!(resp.answers[0].addr, Ipv4Addr::new(192, 168, 100, 10));

        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn port_is_free_as_soon_as_stop_returns() {
        let first = server();
        let listeners = first.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listeners[0].local_addr().unwrap();
        let mut running = first.start(listeners);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for i in 0..30u16 {
            // Keep queries in flight while the listener goes down.
            for _ in 0..5 {
                client.send_to(&build_query(i, &[("example.com", 1)]), addr).await.unwrap();
            }
            running.stop().await;

            let next = server();
            let listeners = next.bind(addr).await.unwrap();
            assert_eq!(listeners[0].local_addr().unwrap(), addr);
            running = next.start(listeners);
        }

        let mut buf = vec![0u8; 512];
        client.send_to(&build_query(999, &[("example.com", 1)]), addr).await.unwrap();
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await.unwrap().unwrap();
            if decode_response(&buf[..n]).unwrap().id == 999 { break; }
        }
        running.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_an_error() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        assert!(server().bind(addr).await.is_err());
    }
}
