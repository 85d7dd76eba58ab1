use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_mtu() -> usize {
    1408
}

/// Declarative configuration of one WireGuard proxy outbound.
///
/// Keys are standard base64; `reserved` is a hex string (optional `0x`
/// prefix) that must decode to exactly 3 bytes. At least one of `ip` /
/// `ipv6` is required; a CIDR suffix on either is accepted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    pub private_key: String,
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default)]
    pub udp: bool,
    #[serde(default)]
    pub remote_dns_resolve: bool,
    #[serde(default)]
    pub reserved: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub routing_mark: Option<u32>,
}

/// Decode the reserved-bytes obfuscation marker.
pub(crate) fn parse_reserved(raw: Option<&str>) -> Result<Option<[u8; 3]>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.to_lowercase();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(&trimmed);
    let bytes = hex::decode(trimmed)
        .map_err(|e| Error::config_with_source("decode wireguard reserved bytes failed", e))?;
    let bytes: [u8; 3] = bytes
        .try_into()
        .map_err(|_| Error::config("wireguard reserved must be exactly 3 bytes"))?;
    Ok(Some(bytes))
}

/// Parse a local tunnel address, dropping any `/prefix` suffix.
pub(crate) fn parse_local_addr(raw: Option<&str>, label: &str) -> Result<Option<IpAddr>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let bare = raw.split('/').next().unwrap_or(raw);
    bare.parse::<IpAddr>()
        .map(Some)
        .map_err(|e| Error::parse_with_source(format!("parse wireguard {} failed", label), e))
}

/// Parse the DNS server list, applying the public-resolver default.
pub(crate) fn parse_dns_servers(dns: &[String]) -> Result<Vec<IpAddr>> {
    if dns.is_empty() {
        return Ok(vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()]);
    }
    dns.iter()
        .map(|raw| {
            raw.parse::<IpAddr>()
                .map_err(|e| Error::parse_with_source(format!("parse wireguard dns address {:?} failed", raw), e))
        })
        .collect()
}
