use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;

/// Standard-alphabet decoder that tolerates nonzero trailing bits, matching
/// the lenient decoding applied to key material by existing deployments.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Ordered `key=value` lines programming a WireGuard engine instance.
///
/// Built once from the outbound configuration, finalized with the resolved
/// server endpoint during bring-up, then discarded. Key material is carried
/// as the raw hex of the base64-decoded keys, as the engine's IPC protocol
/// requires.
#[derive(Debug)]
pub struct UapiConfig {
    keys: Vec<String>,
    allowed_ips: Vec<String>,
}

impl UapiConfig {
    pub fn build(
        private_key: &str,
        public_key: &str,
        preshared_key: Option<&str>,
        allow_v4: bool,
        allow_v6: bool,
    ) -> Result<Self> {
        let mut keys = Vec::with_capacity(3);
        keys.push(format!("private_key={}", hex_key("private key", private_key)?));
        keys.push(format!("public_key={}", hex_key("peer public key", public_key)?));
        if let Some(psk) = preshared_key {
            keys.push(format!("preshared_key={}", hex_key("preshared key", psk)?));
        }

        let mut allowed_ips = Vec::with_capacity(2);
        if allow_v4 {
            allowed_ips.push("allowed_ip=0.0.0.0/0".to_string());
        }
        if allow_v6 {
            allowed_ips.push("allowed_ip=::/0".to_string());
        }

        Ok(Self { keys, allowed_ips })
    }

    /// Assemble the final newline-joined configuration, consuming the lines.
    pub fn finalize(self, endpoint: &Endpoint) -> String {
        let mut lines = self.keys;
        lines.push(format!("endpoint={}", endpoint));
        lines.extend(self.allowed_ips);
        lines.join("\n")
    }
}

fn hex_key(label: &str, encoded: &str) -> Result<String> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| Error::config_with_source(format!("decode wireguard {} failed", label), e))?;
    Ok(hex::encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 32 zero bytes and the all-'B' key from the engine compatibility vector
    const ZERO_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
    const B_KEY: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB=";

    #[test]
    fn lines_are_emitted_in_engine_order() {
        let conf = UapiConfig::build(ZERO_KEY, B_KEY, None, true, false).unwrap();
        let endpoint = Endpoint::parse("203.0.113.1:51820").unwrap();
        let text = conf.finalize(&endpoint);
        let lines: Vec<&str> = text.split('\n').collect();
        let public_hex = hex::encode(BASE64.decode(B_KEY).unwrap());
        assert_eq!(
            lines,
            vec![
                format!("private_key={}", "00".repeat(32)).as_str(),
                format!("public_key={}", public_hex).as_str(),
                "endpoint=203.0.113.1:51820",
                "allowed_ip=0.0.0.0/0",
            ]
        );
        assert!(public_hex.starts_with("041041"));
    }

    #[test]
    fn preshared_key_line_sits_between_public_key_and_endpoint() {
        let conf = UapiConfig::build(ZERO_KEY, ZERO_KEY, Some(ZERO_KEY), true, true).unwrap();
        let endpoint = Endpoint::parse("[2001:db8::1]:2408").unwrap();
        let text = conf.finalize(&endpoint);
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[2].starts_with("preshared_key="));
        assert_eq!(lines[3], "endpoint=[2001:db8::1]:2408");
        assert_eq!(lines[4], "allowed_ip=0.0.0.0/0");
        assert_eq!(lines[5], "allowed_ip=::/0");
    }

    #[test]
    fn no_allowed_ip_lines_without_local_addresses() {
        let conf = UapiConfig::build(ZERO_KEY, ZERO_KEY, None, false, false).unwrap();
        let endpoint = Endpoint::parse("198.51.100.7:1").unwrap();
        let text = conf.finalize(&endpoint);
        assert!(!text.contains("allowed_ip"));
    }

    #[test]
    fn bad_base64_is_a_config_error() {
        let err = UapiConfig::build("!!!", ZERO_KEY, None, true, false).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
