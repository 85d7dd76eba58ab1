//! WireGuard transport layer for a proxy outbound.
//!
//! The crate provides the datagram transport a WireGuard engine drives
//! ([`bind::Bind`]), with two delivery substrates: direct OS UDP sockets
//! ([`bind::StdNetBind`]) and UDP relayed through a pluggable dialer
//! ([`bind::WgBind`]), plus the bring-up logic ([`outbound::WireGuard`])
//! that turns a declarative peer configuration into a running tunnel on
//! first use.

pub mod bind;
pub mod config;
pub mod dialer;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod outbound;
pub mod stack;
pub mod tun;
pub mod uapi;

#[cfg(test)]
mod tests;

pub use bind::{Bind, BindReceiver, StdNetBind, WgBind};
pub use config::WireGuardOption;
pub use dialer::{Dialer, RelayConn, SystemDialer};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use outbound::{TargetAddr, WireGuard};
