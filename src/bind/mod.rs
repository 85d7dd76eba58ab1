use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::endpoint::Endpoint;
use crate::error::Result;

pub mod relay;
pub mod udp;

pub use relay::WgBind;
pub use udp::StdNetBind;

/// Number of datagrams moved per batched syscall on Linux.
pub const IDEAL_BATCH_SIZE: usize = 128;

/// The transport abstraction the WireGuard engine drives for datagram I/O,
/// independent of whether the underlying medium is a raw socket or a
/// connection obtained from a dialer.
#[async_trait]
pub trait Bind: Send + Sync {
    /// Open the bind. Returns one receiver per underlying medium (one per IP
    /// family for sockets, exactly one for a relayed connection) and the
    /// local port actually bound, which may differ from `port` when `port`
    /// is zero.
    async fn open(&self, port: u16) -> Result<(Vec<Arc<dyn BindReceiver>>, u16)>;

    /// Send each buffer as one datagram to `endpoint`. Buffers are patched
    /// in place with the reserved marker before transmission.
    async fn send(&self, bufs: &mut [Vec<u8>], endpoint: &Endpoint) -> Result<()>;

    /// Close the bind and release its sockets or connections.
    async fn close(&self) -> Result<()>;

    /// Apply a routing mark to the bind's sockets.
    fn set_mark(&self, mark: u32) -> Result<()>;

    /// Largest number of buffers the engine should pass to `send` and
    /// `recv_batch` in one call.
    fn batch_size(&self) -> usize;

    /// Parse an endpoint string into this bind's endpoint representation.
    fn parse_endpoint(&self, raw: &str) -> Result<Arc<Endpoint>>;
}

/// One receive loop of a bind. The engine drives each receiver from its own
/// task; receivers must therefore be safe to poll concurrently with `send`
/// and with each other.
#[async_trait]
pub trait BindReceiver: Send + Sync {
    /// Receive up to `bufs.len()` datagrams. For each datagram received,
    /// `sizes[i]` is set to its length and `endpoints[i]` to its source.
    /// Returns the number of datagrams received.
    async fn recv_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        endpoints: &mut [Option<Arc<Endpoint>>],
    ) -> Result<usize>;
}

/// Patch bytes 1-3 of an outgoing datagram with the reserved marker.
/// No-op when no marker is configured or the buffer is too short.
pub(crate) fn set_reserved(buf: &mut [u8], reserved: Option<[u8; 3]>) {
    if buf.len() < 4 {
        return;
    }
    if let Some(r) = reserved {
        buf[1..4].copy_from_slice(&r);
    }
}

/// Zero bytes 1-3 of an incoming datagram so the upper layer always sees
/// canonical WireGuard framing, whatever marker the peer applied.
pub(crate) fn reset_reserved(buf: &mut [u8]) {
    if buf.len() < 4 {
        return;
    }
    buf[1] = 0x00;
    buf[2] = 0x00;
    buf[3] = 0x00;
}

/// One-shot closed signal. Close happens at most once; waiters registered
/// before or after the close all observe it.
pub(crate) struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    /// Mark closed. Returns `true` if this call performed the transition,
    /// `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut closed_now = false;
        self.tx.send_if_modified(|closed| {
            if !*closed {
                *closed = true;
                closed_now = true;
                true
            } else {
                false
            }
        });
        closed_now
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // cannot fail while `self` (the sender) is borrowed
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
