use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A WireGuard peer on the wire: address plus port, compared by value.
///
/// Only the destination side is tracked. This proxy acts purely as a client,
/// so the source address of a received datagram is never needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

/// Re-usable mapping from socket address to shared endpoint. Exists to avoid
/// a fresh allocation per received datagram; endpoints are immutable, so a
/// duplicate entry racing in would be harmless.
///
/// Bounded: the map is flushed once it reaches [`ENDPOINT_CACHE_LIMIT`], so
/// untrusted senders hitting the open port cannot grow it without limit.
/// Entries handed out before a flush stay valid through their `Arc`.
static ENDPOINT_CACHE: Lazy<Mutex<HashMap<SocketAddr, Arc<Endpoint>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const ENDPOINT_CACHE_LIMIT: usize = 4096;

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    /// Parse an `ip:port` (or `[ip]:port`) string.
    pub fn parse(raw: &str) -> Result<Self> {
        raw.parse::<SocketAddr>()
            .map(Self)
            .map_err(|e| Error::parse_with_source(format!("invalid endpoint {:?}", raw), e))
    }

    /// Fetch the shared instance for `addr`, creating it on first use.
    pub fn interned(addr: SocketAddr) -> Arc<Endpoint> {
        let mut cache = ENDPOINT_CACHE.lock();
        if cache.len() >= ENDPOINT_CACHE_LIMIT && !cache.contains_key(&addr) {
            cache.clear();
        }
        cache
            .entry(addr)
            .or_insert_with(|| Arc::new(Endpoint(addr)))
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn cached_count() -> usize {
        ENDPOINT_CACHE.lock().len()
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    /// Binary form: address octets followed by the port in little-endian,
    /// bit-compatible with Go's `netip.AddrPort` encoding.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = match self.0.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        out.extend_from_slice(&self.0.port().to_le_bytes());
        out
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
