use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::bind::{reset_reserved, set_reserved, Bind, BindReceiver, ShutdownSignal, IDEAL_BATCH_SIZE};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Socket-level setup hook (fwmark, interface binding, ...), run against each
/// listener before it is bound.
pub type ControlFn = Box<dyn Fn(&Socket) -> io::Result<()> + Send + Sync>;

/// How often `open` may rebind when hunting for a port both families accept.
const PORT_RETRIES: usize = 100;

#[derive(Default)]
struct Sockets {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
    blackhole4: bool,
    blackhole6: bool,
    /// Closed signal for the current open generation; receivers hang off it.
    shutdown: Option<Arc<ShutdownSignal>>,
}

/// Bind backed by real OS UDP sockets, one per IP family.
///
/// On Linux datagrams are moved with `sendmmsg`/`recvmmsg`; elsewhere one
/// syscall per datagram. Either family may be blackholed, in which case sends
/// for it silently succeed without transmitting.
pub struct StdNetBind {
    sockets: Mutex<Sockets>,
    control: Vec<ControlFn>,
    interface: Option<String>,
    reserved: Option<[u8; 3]>,
}

impl StdNetBind {
    pub fn new(control: Vec<ControlFn>, interface: Option<String>, reserved: Option<[u8; 3]>) -> Self {
        Self {
            sockets: Mutex::new(Sockets::default()),
            control,
            interface,
            reserved,
        }
    }

    /// Silently drop outgoing datagrams for the given families.
    pub fn set_blackhole(&self, v4: bool, v6: bool) {
        let mut sockets = self.sockets.lock();
        sockets.blackhole4 = v4;
        sockets.blackhole6 = v6;
    }

    fn listen(&self, domain: Domain, port: u16) -> io::Result<(Arc<UdpSocket>, u16)> {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if domain == Domain::IPV6 {
            socket.set_only_v6(true)?;
        }
        #[cfg(target_os = "linux")]
        if let Some(name) = &self.interface {
            socket.bind_device(Some(name.as_bytes()))?;
        }
        for control in &self.control {
            control(&socket)?;
        }
        let ip = if domain == Domain::IPV6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        socket.bind(&SocketAddr::new(ip, port).into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        let port = socket.local_addr()?.port();
        Ok((Arc::new(socket), port))
    }
}

#[async_trait]
impl Bind for StdNetBind {
    async fn open(&self, requested: u16) -> Result<(Vec<Arc<dyn BindReceiver>>, u16)> {
        let mut sockets = self.sockets.lock();
        if sockets.v4.is_some() || sockets.v6.is_some() {
            return Err(Error::AlreadyOpen);
        }

        // Attempt to open a v4 and a v6 listener on the same port. With a
        // requested port of zero the kernel picks the v4 port, and we rebind
        // until the v6 side accepts the same number.
        let mut tries = 0;
        let (v4, v6, port) = loop {
            let mut port = requested;
            let v4 = match self.listen(Domain::IPV4, port) {
                Ok((socket, bound)) => {
                    port = bound;
                    Some(socket)
                }
                Err(e) if is_af_not_supported(&e) => None,
                Err(e) => return Err(e.into()),
            };
            match self.listen(Domain::IPV6, port) {
                Ok((socket, bound)) => break (v4, Some(socket), bound),
                Err(e)
                    if requested == 0
                        && e.kind() == io::ErrorKind::AddrInUse
                        && tries < PORT_RETRIES =>
                {
                    drop(v4);
                    tries += 1;
                }
                Err(e) if is_af_not_supported(&e) => break (v4, None, port),
                Err(e) => return Err(e.into()),
            }
        };

        let shutdown = Arc::new(ShutdownSignal::new());
        let mut fns: Vec<Arc<dyn BindReceiver>> = Vec::with_capacity(2);
        // receivers hold the sockets weakly, so close releases the port even
        // while the engine still holds its receive functions
        if let Some(socket) = v4 {
            fns.push(Arc::new(UdpReceiver {
                socket: Arc::downgrade(&socket),
                shutdown: shutdown.clone(),
            }));
            sockets.v4 = Some(socket);
        }
        if let Some(socket) = v6 {
            fns.push(Arc::new(UdpReceiver {
                socket: Arc::downgrade(&socket),
                shutdown: shutdown.clone(),
            }));
            sockets.v6 = Some(socket);
        }
        if fns.is_empty() {
            return Err(Error::AfNotSupported);
        }
        sockets.shutdown = Some(shutdown);

        debug!(port, families = fns.len(), "udp bind open");
        Ok((fns, port))
    }

    async fn send(&self, bufs: &mut [Vec<u8>], endpoint: &Endpoint) -> Result<()> {
        let (socket, blackhole) = {
            let sockets = self.sockets.lock();
            if endpoint.is_ipv6() {
                (sockets.v6.clone(), sockets.blackhole6)
            } else {
                (sockets.v4.clone(), sockets.blackhole4)
            }
        };
        if blackhole {
            return Ok(());
        }
        let Some(socket) = socket else {
            return Err(Error::AfNotSupported);
        };

        for buf in bufs.iter_mut() {
            set_reserved(buf, self.reserved);
        }
        send_batch(&socket, bufs, endpoint.addr()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut sockets = self.sockets.lock();
        sockets.v4 = None;
        sockets.v6 = None;
        sockets.blackhole4 = false;
        sockets.blackhole6 = false;
        if let Some(shutdown) = sockets.shutdown.take() {
            shutdown.close();
        }
        Ok(())
    }

    fn set_mark(&self, _mark: u32) -> Result<()> {
        // marks are applied through the control functions at listen time
        Ok(())
    }

    fn batch_size(&self) -> usize {
        if cfg!(target_os = "linux") {
            IDEAL_BATCH_SIZE
        } else {
            1
        }
    }

    fn parse_endpoint(&self, raw: &str) -> Result<Arc<Endpoint>> {
        let endpoint = Endpoint::parse(raw)?;
        Ok(Endpoint::interned(endpoint.addr()))
    }
}

/// Receive loop state for one IP family. The socket reference is weak so a
/// closed bind does not keep the port alive behind the engine's back.
struct UdpReceiver {
    socket: Weak<UdpSocket>,
    shutdown: Arc<ShutdownSignal>,
}

#[async_trait]
impl BindReceiver for UdpReceiver {
    async fn recv_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        endpoints: &mut [Option<Arc<Endpoint>>],
    ) -> Result<usize> {
        if bufs.is_empty() {
            return Ok(0);
        }
        loop {
            if self.shutdown.is_closed() {
                return Err(Error::Closed);
            }
            let Some(socket) = self.socket.upgrade() else {
                return Err(Error::Closed);
            };
            tokio::select! {
                _ = self.shutdown.wait() => return Err(Error::Closed),
                ready = socket.readable() => ready?,
            }
            match self.try_recv(&socket, bufs, sizes, endpoints) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl UdpReceiver {
    #[cfg(target_os = "linux")]
    fn try_recv(
        &self,
        socket: &UdpSocket,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        endpoints: &mut [Option<Arc<Endpoint>>],
    ) -> io::Result<usize> {
        use std::io::IoSliceMut;
        use std::os::fd::AsRawFd;

        use nix::sys::socket::{recvmmsg, MsgFlags, MultiHeaders, SockaddrStorage};

        socket.try_io(tokio::io::Interest::READABLE, || {
            let mut metas: Vec<(usize, SocketAddr)> = Vec::with_capacity(bufs.len());
            {
                let mut iovs: Vec<[IoSliceMut<'_>; 1]> = bufs
                    .iter_mut()
                    .map(|b| [IoSliceMut::new(b.as_mut_slice())])
                    .collect();
                let mut headers: MultiHeaders<SockaddrStorage> =
                    MultiHeaders::preallocate(iovs.len(), None);
                let msgs = recvmmsg(
                    socket.as_raw_fd(),
                    &mut headers,
                    iovs.iter_mut(),
                    MsgFlags::MSG_DONTWAIT,
                    None,
                )
                .map_err(io::Error::from)?;
                for msg in msgs {
                    let addr = msg
                        .address
                        .as_ref()
                        .and_then(sockaddr_to_std)
                        .ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidData, "datagram without source")
                        })?;
                    metas.push((msg.bytes, addr));
                }
            }
            for (i, (len, addr)) in metas.iter().enumerate() {
                sizes[i] = *len;
                reset_reserved(&mut bufs[i]);
                endpoints[i] = Some(Endpoint::interned(*addr));
            }
            Ok(metas.len())
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn try_recv(
        &self,
        socket: &UdpSocket,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        endpoints: &mut [Option<Arc<Endpoint>>],
    ) -> io::Result<usize> {
        let (len, addr) = socket.try_recv_from(&mut bufs[0])?;
        sizes[0] = len;
        reset_reserved(&mut bufs[0]);
        endpoints[0] = Some(Endpoint::interned(addr));
        Ok(1)
    }
}

#[cfg(target_os = "linux")]
async fn send_batch(socket: &UdpSocket, bufs: &[Vec<u8>], target: SocketAddr) -> io::Result<()> {
    // flush the whole batch, resuming after partial sendmmsg results
    let mut start = 0;
    while start < bufs.len() {
        socket.writable().await?;
        match socket.try_io(tokio::io::Interest::WRITABLE, || {
            sendmmsg_once(socket, &bufs[start..], target)
        }) {
            Ok(sent) => start += sent,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn sendmmsg_once(socket: &UdpSocket, bufs: &[Vec<u8>], target: SocketAddr) -> io::Result<usize> {
    use std::io::IoSlice;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{sendmmsg, ControlMessage, MsgFlags, MultiHeaders, SockaddrStorage};

    let iovs: Vec<[IoSlice<'_>; 1]> = bufs.iter().map(|b| [IoSlice::new(b)]).collect();
    let addrs: Vec<Option<SockaddrStorage>> =
        bufs.iter().map(|_| Some(SockaddrStorage::from(target))).collect();
    let mut headers: MultiHeaders<SockaddrStorage> = MultiHeaders::preallocate(bufs.len(), None);
    let cmsgs: Vec<ControlMessage<'_>> = Vec::new();
    let results = sendmmsg(
        socket.as_raw_fd(),
        &mut headers,
        &iovs,
        &addrs,
        &cmsgs,
        MsgFlags::MSG_DONTWAIT,
    )
    .map_err(io::Error::from)?;
    let sent = results.into_iter().count();
    if sent == 0 {
        return Err(io::ErrorKind::WouldBlock.into());
    }
    Ok(sent)
}

#[cfg(not(target_os = "linux"))]
async fn send_batch(socket: &UdpSocket, bufs: &[Vec<u8>], target: SocketAddr) -> io::Result<()> {
    for buf in bufs {
        socket.send_to(buf, target).await?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn sockaddr_to_std(addr: &nix::sys::socket::SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        Some(SocketAddr::new(IpAddr::V4(sin.ip()), sin.port()))
    } else if let Some(sin6) = addr.as_sockaddr_in6() {
        Some(SocketAddr::new(IpAddr::V6(sin6.ip()), sin6.port()))
    } else {
        None
    }
}

#[cfg(unix)]
fn is_af_not_supported(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EAFNOSUPPORT)
}

#[cfg(not(unix))]
fn is_af_not_supported(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Unsupported
}
