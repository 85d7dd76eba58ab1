use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bind::Bind;
use crate::error::{Error, Result};

/// Byte stream carried over the virtual stack. Anything duplex works.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProxyStream for T {}

/// Unconnected datagram socket opened on the virtual stack.
#[async_trait]
pub trait StackPacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// The userspace network stack riding on top of the tunnel device. Dialing
/// takes `host:port` so DNS can be answered inside the tunnel when remote
/// resolution is on.
#[async_trait]
pub trait VirtualStack: Send + Sync {
    async fn dial_tcp(&self, addr: &str) -> io::Result<Box<dyn ProxyStream>>;
    async fn listen_udp(&self, local: SocketAddr) -> io::Result<Box<dyn StackPacketConn>>;
    async fn lookup_host(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Packet device the WireGuard engine reads decrypted frames from and writes
/// plaintext frames to.
pub trait TunDevice: Send + Sync {
    fn mtu(&self) -> usize;
}

/// Builds the paired virtual device and stack for one outbound.
pub trait NetTunFactory: Send + Sync {
    fn create(
        &self,
        local: &[IpAddr],
        dns: &[IpAddr],
        mtu: usize,
    ) -> Result<(Arc<dyn TunDevice>, Arc<dyn VirtualStack>)>;
}

/// A running WireGuard engine instance.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Program the engine with newline-joined `key=value` lines.
    async fn apply_uapi(&self, conf: &str) -> Result<()>;
    async fn close(&self);
}

/// Creates engine instances over a device and a bind.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        tun: Arc<dyn TunDevice>,
        bind: Arc<dyn Bind>,
        name: &str,
    ) -> Result<Arc<dyn Engine>>;
}

/// Name resolution outside the tunnel, used for the server during bring-up
/// and for targets when in-tunnel resolution is off. Returns every address
/// so the caller decides which to use.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the OS. IP literals short-circuit without a lookup.
#[derive(Debug, Default, Clone)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::dns_with_source(format!("resolve {:?} failed", host), e))?
            .map(|addr| addr.ip())
            .collect();
        if addrs.is_empty() {
            return Err(Error::dns(format!("resolve {:?} returned no addresses", host)));
        }
        Ok(addrs)
    }
}
