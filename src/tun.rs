use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::stack::ProxyStream;

const DNS_TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Which transport a DNS hijack rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsNet {
    Udp,
    Tcp,
    Any,
}

impl DnsNet {
    fn matches(self, other: DnsNet) -> bool {
        self == DnsNet::Any || self == other
    }
}

/// One address the demultiplexer intercepts DNS traffic for. An unspecified
/// IP (`0.0.0.0` / `::`) matches any destination address on the rule's port.
#[derive(Debug, Clone, Copy)]
pub struct DnsHijackRule {
    pub network: DnsNet,
    pub addr: SocketAddr,
}

pub fn should_hijack_dns(rules: &[DnsHijackRule], dest: SocketAddr, network: DnsNet) -> bool {
    rules.iter().any(|rule| {
        rule.network.matches(network)
            && rule.addr.port() == dest.port()
            && (rule.addr.ip().is_unspecified() || rule.addr.ip() == dest.ip())
    })
}

/// A TCP stream surfaced from the virtual stack, addressed as the tunneled
/// application saw it.
pub struct TcpSession {
    pub stream: Box<dyn ProxyStream>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// One UDP datagram surfaced from the virtual stack. When `respond` is set,
/// the consumer may send exactly one reply back to the originating socket.
pub struct UdpPacket {
    pub data: Bytes,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub respond: Option<oneshot::Sender<Bytes>>,
}

/// Answers raw DNS messages for hijacked queries.
#[async_trait::async_trait]
pub trait DnsRelay: Send + Sync {
    async fn relay(&self, query: &[u8]) -> io::Result<Vec<u8>>;
}

/// Boundary between the virtual network stack and the proxy's inbound
/// queues. TCP sessions are forwarded (or answered in place when they match
/// a DNS hijack rule); UDP datagrams addressed to the stack's own gateway or
/// broadcast address are dropped, and the rest are queued without blocking
/// the stack.
pub struct TunHandler {
    gateway: IpAddr,
    broadcast: IpAddr,
    hijack: Vec<DnsHijackRule>,
    dns: Arc<dyn DnsRelay>,
    tcp_in: mpsc::Sender<TcpSession>,
    udp_in: mpsc::Sender<UdpPacket>,
}

impl TunHandler {
    pub fn new(
        gateway: IpAddr,
        broadcast: IpAddr,
        hijack: Vec<DnsHijackRule>,
        dns: Arc<dyn DnsRelay>,
        tcp_in: mpsc::Sender<TcpSession>,
        udp_in: mpsc::Sender<UdpPacket>,
    ) -> Self {
        Self {
            gateway,
            broadcast,
            hijack,
            dns,
            tcp_in,
            udp_in,
        }
    }

    pub async fn handle_tcp(&self, session: TcpSession) {
        if should_hijack_dns(&self.hijack, session.remote, DnsNet::Tcp) {
            debug!(addr = %session.remote, "hijack tcp dns");
            let dns = self.dns.clone();
            tokio::spawn(async move {
                let _ = tokio::time::timeout(
                    DNS_TCP_TIMEOUT,
                    relay_tcp_dns(session.stream, dns),
                )
                .await;
            });
            return;
        }
        // dropped only when the consumer side is gone, nothing to salvage
        let _ = self.tcp_in.send(session).await;
    }

    pub async fn handle_udp(&self, mut packet: UdpPacket) {
        if packet.remote.ip() == self.gateway || packet.remote.ip() == self.broadcast {
            return;
        }
        if should_hijack_dns(&self.hijack, packet.remote, DnsNet::Udp) {
            debug!(addr = %packet.remote, "hijack udp dns");
            let dns = self.dns.clone();
            let respond = packet.respond.take();
            tokio::spawn(async move {
                if let Ok(msg) = dns.relay(&packet.data).await {
                    if let Some(tx) = respond {
                        let _ = tx.send(Bytes::from(msg));
                    }
                }
            });
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(packet)) = self.udp_in.try_send(packet) {
            debug!(
                local = %packet.local,
                remote = %packet.remote,
                "drop udp packet, inbound queue is full"
            );
        }
    }
}

/// Answer one DNS query over a hijacked TCP stream: 2-byte big-endian length
/// prefix on both the query and the response.
async fn relay_tcp_dns(
    mut stream: Box<dyn ProxyStream>,
    dns: Arc<dyn DnsRelay>,
) -> io::Result<()> {
    let length = stream.read_u16().await?;
    let mut query = vec![0u8; length as usize];
    stream.read_exact(&mut query).await?;

    let msg = dns.relay(&query).await?;
    stream.write_u16(msg.len() as u16).await?;
    stream.write_all(&msg).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDns;

    #[async_trait::async_trait]
    impl DnsRelay for EchoDns {
        async fn relay(&self, query: &[u8]) -> io::Result<Vec<u8>> {
            let mut out = query.to_vec();
            out.reverse();
            Ok(out)
        }
    }

    fn handler(
        hijack: Vec<DnsHijackRule>,
        udp_capacity: usize,
    ) -> (TunHandler, mpsc::Receiver<TcpSession>, mpsc::Receiver<UdpPacket>) {
        let (tcp_tx, tcp_rx) = mpsc::channel(16);
        let (udp_tx, udp_rx) = mpsc::channel(udp_capacity);
        let handler = TunHandler::new(
            "198.18.0.1".parse().unwrap(),
            "198.18.255.255".parse().unwrap(),
            hijack,
            Arc::new(EchoDns),
            tcp_tx,
            udp_tx,
        );
        (handler, tcp_rx, udp_rx)
    }

    fn dns_rule() -> DnsHijackRule {
        DnsHijackRule {
            network: DnsNet::Any,
            addr: "0.0.0.0:53".parse().unwrap(),
        }
    }

    fn udp_packet(remote: &str) -> UdpPacket {
        UdpPacket {
            data: Bytes::from_static(b"\x12\x34query"),
            local: "198.18.0.5:40000".parse().unwrap(),
            remote: remote.parse().unwrap(),
            respond: None,
        }
    }

    #[test]
    fn hijack_matches_port_network_and_wildcard_address() {
        let rules = vec![
            DnsHijackRule {
                network: DnsNet::Udp,
                addr: "0.0.0.0:53".parse().unwrap(),
            },
            DnsHijackRule {
                network: DnsNet::Tcp,
                addr: "10.0.0.1:5353".parse().unwrap(),
            },
        ];
        assert!(should_hijack_dns(
            &rules,
            "8.8.8.8:53".parse().unwrap(),
            DnsNet::Udp
        ));
        assert!(!should_hijack_dns(
            &rules,
            "8.8.8.8:53".parse().unwrap(),
            DnsNet::Tcp
        ));
        assert!(should_hijack_dns(
            &rules,
            "10.0.0.1:5353".parse().unwrap(),
            DnsNet::Tcp
        ));
        assert!(!should_hijack_dns(
            &rules,
            "10.0.0.2:5353".parse().unwrap(),
            DnsNet::Tcp
        ));
        assert!(!should_hijack_dns(
            &rules,
            "8.8.8.8:443".parse().unwrap(),
            DnsNet::Udp
        ));
    }

    #[tokio::test]
    async fn gateway_and_broadcast_udp_is_dropped() {
        let (handler, _tcp_rx, mut udp_rx) = handler(vec![], 16);
        handler.handle_udp(udp_packet("198.18.0.1:53")).await;
        handler.handle_udp(udp_packet("198.18.255.255:1900")).await;
        handler.handle_udp(udp_packet("1.2.3.4:443")).await;

        let forwarded = udp_rx.recv().await.unwrap();
        assert_eq!(forwarded.remote, "1.2.3.4:443".parse().unwrap());
        assert!(udp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_udp_queue_drops_instead_of_blocking() {
        let (handler, _tcp_rx, mut udp_rx) = handler(vec![], 1);
        handler.handle_udp(udp_packet("1.2.3.4:443")).await;
        handler.handle_udp(udp_packet("5.6.7.8:443")).await;

        assert_eq!(
            udp_rx.recv().await.unwrap().remote,
            "1.2.3.4:443".parse().unwrap()
        );
        assert!(udp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hijacked_udp_query_is_answered_via_oneshot() {
        let (handler, _tcp_rx, mut udp_rx) = handler(vec![dns_rule()], 16);
        let (tx, rx) = oneshot::channel();
        let mut packet = udp_packet("8.8.8.8:53");
        packet.respond = Some(tx);
        handler.handle_udp(packet).await;

        let reply = rx.await.unwrap();
        let mut expected = b"\x12\x34query".to_vec();
        expected.reverse();
        assert_eq!(&reply[..], &expected[..]);
        assert!(udp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hijacked_tcp_dns_round_trips_length_framing() {
        let (handler, mut tcp_rx, _udp_rx) = handler(vec![dns_rule()], 16);
        let (client, server) = tokio::io::duplex(512);
        handler
            .handle_tcp(TcpSession {
                stream: Box::new(server),
                local: "198.18.0.5:40001".parse().unwrap(),
                remote: "8.8.8.8:53".parse().unwrap(),
            })
            .await;
        assert!(tcp_rx.try_recv().is_err());

        let mut client = client;
        let query = b"abcd";
        client.write_u16(query.len() as u16).await.unwrap();
        client.write_all(query).await.unwrap();

        let length = client.read_u16().await.unwrap();
        let mut reply = vec![0u8; length as usize];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"dcba");
    }

    #[tokio::test]
    async fn plain_tcp_sessions_are_forwarded() {
        let (handler, mut tcp_rx, _udp_rx) = handler(vec![dns_rule()], 16);
        let (_client, server) = tokio::io::duplex(64);
        handler
            .handle_tcp(TcpSession {
                stream: Box::new(server),
                local: "198.18.0.5:40002".parse().unwrap(),
                remote: "93.184.216.34:443".parse().unwrap(),
            })
            .await;
        let session = tcp_rx.recv().await.unwrap();
        assert_eq!(session.remote, "93.184.216.34:443".parse().unwrap());
    }
}
