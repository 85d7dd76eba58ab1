//! Property-based tests for the transport framing and endpoint model.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use proptest::prelude::*;

use crate::bind::{reset_reserved, set_reserved};
use crate::endpoint::Endpoint;
use crate::uapi::UapiConfig;

fn packet_strategy() -> impl Strategy<Value = Vec<u8>> {
    // canonical WireGuard framing: bytes 1-3 are zero on the wire
    prop::collection::vec(any::<u8>(), 4..256).prop_map(|mut pkt| {
        pkt[1] = 0;
        pkt[2] = 0;
        pkt[3] = 0;
        pkt
    })
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop::array::uniform32(any::<u8>()).prop_map(|raw| STANDARD.encode(raw))
}

proptest! {
    /// Patching the reserved marker on the way out and stripping it on the
    /// way in must hand the upper layer back exactly what it sent.
    #[test]
    fn reserved_marker_round_trips(pkt in packet_strategy(), marker in any::<[u8; 3]>()) {
        let original = pkt.clone();
        let mut pkt = pkt;
        set_reserved(&mut pkt, Some(marker));
        prop_assert_eq!(&pkt[1..4], &marker[..]);
        reset_reserved(&mut pkt);
        prop_assert_eq!(pkt, original);
    }

    #[test]
    fn interning_is_stable_per_address(a in any::<u32>(), port in 1u16..) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(a)), port);
        let first = Endpoint::interned(addr);
        let second = Endpoint::interned(addr);
        prop_assert_eq!(*first, *second);
        prop_assert_eq!(first.addr(), addr);
    }

    #[test]
    fn endpoint_display_parses_back(a in any::<u32>(), port in 1u16..) {
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::from(a)), port);
        let reparsed = Endpoint::parse(&ep.to_string()).unwrap();
        prop_assert_eq!(reparsed, ep);
    }

    /// Whatever the key material, the UAPI lines come out in the fixed
    /// order the engine requires.
    #[test]
    fn uapi_line_order_is_fixed(
        private in key_strategy(),
        public in key_strategy(),
        preshared in prop::option::of(key_strategy()),
        allow_v4 in any::<bool>(),
        allow_v6 in any::<bool>(),
    ) {
        let conf = UapiConfig::build(&private, &public, preshared.as_deref(), allow_v4, allow_v6)
            .unwrap();
        let endpoint = Endpoint::parse("192.0.2.1:51820").unwrap();
        let text = conf.finalize(&endpoint);
        let lines: Vec<&str> = text.split('\n').collect();

        let mut expected = vec!["private_key", "public_key"];
        if preshared.is_some() {
            expected.push("preshared_key");
        }
        expected.push("endpoint");
        if allow_v4 {
            expected.push("allowed_ip");
        }
        if allow_v6 {
            expected.push("allowed_ip");
        }
        let keys: Vec<&str> = lines
            .iter()
            .map(|line| line.split('=').next().unwrap())
            .collect();
        prop_assert_eq!(keys, expected);
        prop_assert!(lines.contains(&"endpoint=192.0.2.1:51820"));
    }
}
