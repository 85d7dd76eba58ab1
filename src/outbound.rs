use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::bind::udp::ControlFn;
use crate::bind::{Bind, StdNetBind, WgBind};
use crate::config::{parse_dns_servers, parse_local_addr, parse_reserved, WireGuardOption};
use crate::dialer::Dialer;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::stack::{
    Engine, EngineFactory, NameResolver, NetTunFactory, ProxyStream, StackPacketConn,
    SystemResolver, VirtualStack,
};
use crate::uapi::UapiConfig;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const RESOLVE_ATTEMPTS: u32 = 5;
const RESOLVE_BACKOFF: Duration = Duration::from_secs(2);

/// Where an outbound connection should go: a still-unresolved name or a
/// concrete socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Domain(String, u16),
    Ip(SocketAddr),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
            Self::Ip(addr) => addr.fmt(f),
        }
    }
}

/// Everything a running tunnel owns. Dropped only through [`WireGuard::close`].
struct Tunnel {
    bind: Arc<dyn Bind>,
    stack: Arc<dyn VirtualStack>,
    engine: Arc<dyn Engine>,
}

/// WireGuard proxy outbound.
///
/// Construction validates the configuration and prepares the UAPI lines, but
/// the tunnel itself comes up lazily on the first dial or listen. Bring-up
/// runs exactly once however many callers race into it; its outcome, success
/// or failure, is cached for the lifetime of the outbound.
pub struct WireGuard {
    name: String,
    server: String,
    port: u16,
    local_v4: Option<IpAddr>,
    local_v6: Option<IpAddr>,
    dns: Vec<IpAddr>,
    mtu: usize,
    udp: bool,
    remote_dns_resolve: bool,
    reserved: Option<[u8; 3]>,
    interface: Option<String>,
    routing_mark: Option<u32>,

    uapi: Mutex<Option<UapiConfig>>,
    tunnel: OnceCell<std::result::Result<Tunnel, Error>>,
    closed: AtomicBool,

    relay_dialer: Option<Arc<dyn Dialer>>,
    resolver: Arc<dyn NameResolver>,
    net_tun: Arc<dyn NetTunFactory>,
    engines: Arc<dyn EngineFactory>,
}

impl WireGuard {
    pub fn new(
        option: WireGuardOption,
        net_tun: Arc<dyn NetTunFactory>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        let local_v4 = parse_local_addr(option.ip.as_deref(), "ip")?;
        let local_v6 = parse_local_addr(option.ipv6.as_deref(), "ipv6")?;
        if local_v4.is_none() && local_v6.is_none() {
            return Err(Error::config(
                "wireguard requires at least one of ip / ipv6",
            ));
        }

        let uapi = UapiConfig::build(
            &option.private_key,
            &option.public_key,
            option.preshared_key.as_deref(),
            local_v4.is_some(),
            local_v6.is_some(),
        )?;

        Ok(Self {
            name: option.name,
            server: option.server,
            port: option.port,
            local_v4,
            local_v6,
            dns: parse_dns_servers(&option.dns)?,
            mtu: option.mtu,
            udp: option.udp,
            remote_dns_resolve: option.remote_dns_resolve,
            reserved: parse_reserved(option.reserved.as_deref())?,
            interface: option.interface,
            routing_mark: option.routing_mark,
            uapi: Mutex::new(Some(uapi)),
            tunnel: OnceCell::new(),
            closed: AtomicBool::new(false),
            relay_dialer: None,
            resolver: Arc::new(SystemResolver),
            net_tun,
            engines,
        })
    }

    /// Route the tunnel's own UDP traffic through `dialer` instead of raw
    /// OS sockets.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.relay_dialer = Some(dialer);
        self
    }

    /// Replace the resolver used for the server name during bring-up.
    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports_udp(&self) -> bool {
        self.udp
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Dial a TCP connection through the tunnel under the default deadline.
    pub async fn dial(&self, target: &TargetAddr) -> Result<Box<dyn ProxyStream>> {
        self.dial_with_deadline(target, DIAL_TIMEOUT).await
    }

    pub async fn dial_with_deadline(
        &self,
        target: &TargetAddr,
        deadline: Duration,
    ) -> Result<Box<dyn ProxyStream>> {
        tokio::time::timeout(deadline, self.dial_inner(target))
            .await
            .map_err(|_| Error::timeout(format!("dial {} via {} timed out", target, self.name)))?
    }

    async fn dial_inner(&self, target: &TargetAddr) -> Result<Box<dyn ProxyStream>> {
        let tunnel = self.up().await?;
        let addr = match target {
            TargetAddr::Ip(addr) => addr.to_string(),
            TargetAddr::Domain(host, port) => {
                if self.remote_dns_resolve {
                    // the stack resolves the name inside the tunnel
                    format!("{}:{}", host, port)
                } else {
                    let ip = self.resolve_local(host, true).await?;
                    SocketAddr::new(ip, *port).to_string()
                }
            }
        };
        tunnel.stack.dial_tcp(&addr).await.map_err(|e| {
            Error::network_with_source(format!("dial {} via {} failed", addr, self.name), e)
        })
    }

    /// Open an unconnected UDP socket on the tunnel, bound to the local
    /// tunnel address matching the destination's family. Domain targets are
    /// resolved first, inside or outside the tunnel per the
    /// remote-dns-resolve flag.
    pub async fn listen_packet(&self, target: &TargetAddr) -> Result<Box<dyn StackPacketConn>> {
        let tunnel = self.up().await?;
        let remote_ip = match target {
            TargetAddr::Ip(addr) => addr.ip(),
            TargetAddr::Domain(host, _) => {
                if self.remote_dns_resolve {
                    let ips = tunnel.stack.lookup_host(host).await.map_err(|e| {
                        Error::dns_with_source(format!("resolve {:?} in tunnel failed", host), e)
                    })?;
                    ips.first().copied().ok_or_else(|| {
                        Error::dns(format!("resolve {:?} in tunnel returned no addresses", host))
                    })?
                } else {
                    self.resolve_local(host, false).await?
                }
            }
        };
        let local = if remote_ip.is_ipv6() {
            self.local_v6.ok_or(Error::AfNotSupported)?
        } else {
            self.local_v4.ok_or(Error::AfNotSupported)?
        };
        tunnel
            .stack
            .listen_udp(SocketAddr::new(local, 0))
            .await
            .map_err(|e| {
                Error::network_with_source(format!("listen on {} failed", self.name), e)
            })
    }

    /// Tear down the tunnel. Later calls are no-ops; an outbound that never
    /// came up has nothing to release.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(Ok(tunnel)) = self.tunnel.get() {
            tunnel.engine.close().await;
            match tunnel.bind.close().await {
                Ok(()) | Err(Error::Closed) => {}
                Err(e) => warn!(proxy = %self.name, error = %e, "bind close failed"),
            }
        }
    }

    /// Bring the tunnel up, or return the cached outcome of a previous
    /// attempt.
    async fn up(&self) -> Result<&Tunnel> {
        let outcome = self.tunnel.get_or_init(|| self.init()).await;
        match outcome {
            Ok(tunnel) => Ok(tunnel),
            Err(e) => Err(Error::proxy(format!(
                "proxy {} failed to start: {}",
                self.name, e
            ))),
        }
    }

    async fn init(&self) -> std::result::Result<Tunnel, Error> {
        let ip = self.resolve_server().await?;
        let endpoint = Endpoint::interned(SocketAddr::new(ip, self.port));
        debug!(proxy = %self.name, endpoint = %endpoint, "bringing tunnel up");

        let conf = {
            let uapi = self
                .uapi
                .lock()
                .take()
                .ok_or_else(|| Error::config("uapi configuration already consumed"))?;
            uapi.finalize(&endpoint)
        };

        let bind: Arc<dyn Bind> = match &self.relay_dialer {
            Some(dialer) => Arc::new(WgBind::new(dialer.clone(), endpoint, self.reserved)),
            None => Arc::new(StdNetBind::new(
                control_fns(self.routing_mark),
                self.interface.clone(),
                self.reserved,
            )),
        };

        let locals: Vec<IpAddr> = self.local_v4.into_iter().chain(self.local_v6).collect();
        let (tun, stack) = self.net_tun.create(&locals, &self.dns, self.mtu)?;
        let engine = self.engines.create(tun, bind.clone(), &self.name)?;
        engine.apply_uapi(&conf).await?;

        Ok(Tunnel {
            bind,
            stack,
            engine,
        })
    }

    /// Resolve a target host through the outside resolver; dials spread load
    /// by picking a random address, listens take the first.
    async fn resolve_local(&self, host: &str, pick_random: bool) -> Result<IpAddr> {
        let ips = self.resolver.resolve(host).await?;
        let ip = if pick_random {
            ips.choose(&mut rand::thread_rng()).copied()
        } else {
            ips.first().copied()
        };
        ip.ok_or_else(|| Error::dns(format!("resolve {:?} returned no addresses", host)))
    }

    /// Resolve the server name, pausing between failed attempts. Runs inside
    /// the bring-up guard, so only the first caller pays for the retries.
    async fn resolve_server(&self) -> Result<IpAddr> {
        let mut attempt = 1;
        loop {
            let outcome = self.resolver.resolve(&self.server).await.and_then(|ips| {
                ips.first().copied().ok_or_else(|| {
                    Error::dns(format!("resolve {:?} returned no addresses", self.server))
                })
            });
            match outcome {
                Ok(ip) => return Ok(ip),
                Err(e) if attempt < RESOLVE_ATTEMPTS => {
                    debug!(
                        proxy = %self.name,
                        server = %self.server,
                        attempt,
                        error = %e,
                        "server resolution failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(RESOLVE_BACKOFF).await;
                }
                Err(e) => {
                    return Err(Error::dns_with_source(
                        format!(
                            "resolve {} failed after {} attempts",
                            self.server, RESOLVE_ATTEMPTS
                        ),
                        e,
                    ))
                }
            }
        }
    }

}

fn control_fns(routing_mark: Option<u32>) -> Vec<ControlFn> {
    #[cfg(target_os = "linux")]
    {
        let mut fns: Vec<ControlFn> = Vec::new();
        if let Some(mark) = routing_mark {
            fns.push(Box::new(move |socket: &socket2::Socket| {
                socket.set_mark(mark)
            }));
        }
        fns
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = routing_mark;
        Vec::new()
    }
}
