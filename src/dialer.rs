use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// A datagram connection to a fixed peer, as handed out by a [`Dialer`].
/// Receive and send take a shared reference so one connection can serve the
/// bind's concurrent receive loop and senders.
#[async_trait]
pub trait RelayConn: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl RelayConn for UdpSocket {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }
}

/// The only thing the relayed bind needs from the outer proxy system: a way
/// to obtain a connection to the peer. Implementations may mark the socket,
/// bind it to an interface, or chain through another proxy. Deadlines are the
/// dialer's own responsibility.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, addr: SocketAddr) -> io::Result<Box<dyn RelayConn>>;
}

/// Plain OS dialer with optional fwmark and interface binding.
#[derive(Debug, Default, Clone)]
pub struct SystemDialer {
    pub mark: Option<u32>,
    pub interface: Option<String>,
}

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, network: &str, addr: SocketAddr) -> io::Result<Box<dyn RelayConn>> {
        if network != "udp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network {:?}", network),
            ));
        }

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        #[cfg(target_os = "linux")]
        {
            if let Some(mark) = self.mark {
                socket.set_mark(mark)?;
            }
            if let Some(name) = &self.interface {
                socket.bind_device(Some(name.as_bytes()))?;
            }
        }
        let local = if addr.is_ipv6() {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        };
        socket.bind(&local.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(addr).await?;
        Ok(Box::new(socket))
    }
}
