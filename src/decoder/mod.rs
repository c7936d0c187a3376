//! Layer decoder for flowtop
//!
//! A registry of decode-in-place header parsers. One decoder instance
//! belongs to one capture thread; the parser structs and the decoded-tag
//! vector are reused across packets so the per-packet hot path does not
//! allocate.

pub mod layers;

use crate::capture::LinkKind;
use layers::{
    ArpLayer, DnsLayer, Dot1qLayer, EthernetLayer, GreLayer, Icmpv4Layer, Ipv4Layer, LinuxSllLayer,
    LlcLayer, PayloadLayer, TcpLayer, UdpLayer,
};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Tag identifying a protocol layer, decodable or not.
///
/// Tags past `Payload` have no registered parser; they exist so a parser can
/// name the protocol its payload carries and the chain can stop on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerClass {
    Ethernet,
    LinuxSll,
    Dot1q,
    Ipv4,
    Tcp,
    Udp,
    Dns,
    Icmpv4,
    Gre,
    Llc,
    Arp,
    Payload,
    Ipv6,
    Dhcpv4,
    Igmp,
    Tls,
    Stp,
    Ntp,
    Vrrp,
    Snap,
    LinkLayerDiscovery,
    Fragment,
    Other(u16),
}

impl fmt::Display for LayerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerClass::Ethernet => write!(f, "Ethernet"),
            LayerClass::LinuxSll => write!(f, "LinuxSLL"),
            LayerClass::Dot1q => write!(f, "Dot1Q"),
            LayerClass::Ipv4 => write!(f, "IPv4"),
            LayerClass::Tcp => write!(f, "TCP"),
            LayerClass::Udp => write!(f, "UDP"),
            LayerClass::Dns => write!(f, "DNS"),
            LayerClass::Icmpv4 => write!(f, "ICMPv4"),
            LayerClass::Gre => write!(f, "GRE"),
            LayerClass::Llc => write!(f, "LLC"),
            LayerClass::Arp => write!(f, "ARP"),
            LayerClass::Payload => write!(f, "Payload"),
            LayerClass::Ipv6 => write!(f, "IPv6"),
            LayerClass::Dhcpv4 => write!(f, "DHCPv4"),
            LayerClass::Igmp => write!(f, "IGMP"),
            LayerClass::Tls => write!(f, "TLS"),
            LayerClass::Stp => write!(f, "STP"),
            LayerClass::Ntp => write!(f, "NTP"),
            LayerClass::Vrrp => write!(f, "VRRP"),
            LayerClass::Snap => write!(f, "SNAP"),
            LayerClass::LinkLayerDiscovery => write!(f, "LinkLayerDiscovery"),
            LayerClass::Fragment => write!(f, "Fragment"),
            LayerClass::Other(tag) => write!(f, "unknown layer type 0x{:04x}", tag),
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{layer} header truncated: need {needed} bytes, have {have}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("invalid {layer} header: {reason}")]
    Malformed {
        layer: &'static str,
        reason: &'static str,
    },
}

impl DecodeError {
    pub(crate) fn truncated(layer: &'static str, needed: usize, have: usize) -> Self {
        DecodeError::Truncated {
            layer,
            needed,
            have,
        }
    }
}

/// Outcome of a successful chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The packet was consumed to the end of its payload.
    Complete,
    /// A layer named a next type no parser is registered for; the tag is
    /// carried so callers can see what was left undecoded.
    Unsupported(LayerClass),
}

/// Per-parser decode result: the declared next layer (`None` ends the
/// chain) and the remaining payload.
pub type LayerResult<'a> = Result<(Option<LayerClass>, &'a [u8]), DecodeError>;

/// Decode registry plus the pre-allocated parser structs it dispatches to.
///
/// After `decode_layers` returns, the fields of every parser named in the
/// decoded sequence hold that packet's header values.
pub struct LayerDecoder {
    pub ethernet: EthernetLayer,
    pub linux_sll: LinuxSllLayer,
    pub dot1q: Dot1qLayer,
    pub ipv4: Ipv4Layer,
    pub tcp: TcpLayer,
    pub udp: UdpLayer,
    pub dns: DnsLayer,
    pub icmpv4: Icmpv4Layer,
    pub gre: GreLayer,
    pub llc: LlcLayer,
    pub arp: ArpLayer,
    pub payload: PayloadLayer,
    registered: HashSet<LayerClass>,
}

impl LayerDecoder {
    /// Build a decoder with the link and network layers registered, plus
    /// the transport layers when `decode_l4` is set.
    pub fn new(decode_l4: bool) -> Self {
        let mut registered: HashSet<LayerClass> = HashSet::new();
        registered.insert(LayerClass::Ethernet);
        registered.insert(LayerClass::LinuxSll);
        registered.insert(LayerClass::Dot1q);
        registered.insert(LayerClass::Ipv4);
        registered.insert(LayerClass::Payload);
        if decode_l4 {
            registered.insert(LayerClass::Tcp);
            registered.insert(LayerClass::Udp);
            registered.insert(LayerClass::Dns);
            registered.insert(LayerClass::Icmpv4);
            registered.insert(LayerClass::Gre);
            registered.insert(LayerClass::Llc);
            registered.insert(LayerClass::Arp);
        }

        Self {
            ethernet: EthernetLayer::default(),
            linux_sll: LinuxSllLayer::default(),
            dot1q: Dot1qLayer::default(),
            ipv4: Ipv4Layer::default(),
            tcp: TcpLayer::default(),
            udp: UdpLayer::default(),
            dns: DnsLayer::default(),
            icmpv4: Icmpv4Layer::default(),
            gre: GreLayer::default(),
            llc: LlcLayer::default(),
            arp: ArpLayer::default(),
            payload: PayloadLayer::default(),
            registered,
        }
    }

    pub fn registered(&self, layer: LayerClass) -> bool {
        self.registered.contains(&layer)
    }

    /// Starting layer for a driver link kind, or `None` when no registered
    /// parser handles it. Callers treat `None` as fatal for their session.
    pub fn first_layer(&self, link: LinkKind) -> Option<LayerClass> {
        let candidate = match link {
            LinkKind::Ethernet => LayerClass::Ethernet,
            LinkKind::LinuxSll => LayerClass::LinuxSll,
            LinkKind::Raw => LayerClass::Ipv4,
        };

        if self.registered(candidate) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Walk `data` through the parser chain starting at `first`, appending
    /// each decoded tag to `decoded`.
    ///
    /// The walk stops on an empty payload, on a next type without a
    /// registered parser (reported as `Unsupported`, not an error), or on a
    /// parser failure. Layers decoded before a failure remain in `decoded`.
    pub fn decode_layers<'a>(
        &mut self,
        mut data: &'a [u8],
        first: LayerClass,
        decoded: &mut Vec<LayerClass>,
    ) -> Result<DecodeOutcome, DecodeError> {
        decoded.clear();

        if data.is_empty() {
            return Ok(DecodeOutcome::Complete);
        }
        if !self.registered(first) {
            return Ok(DecodeOutcome::Unsupported(first));
        }

        let mut layer = first;
        loop {
            let (mut next, payload) = self.decode_one(layer, data)?;
            decoded.push(layer);

            // A first fragment still carries the full transport header, so
            // keep decoding it instead of stopping at the Fragment tag.
            // Later fragments only carry payload bytes and fall through.
            if layer == LayerClass::Ipv4 && self.ipv4.more_fragments && self.ipv4.fragment_offset == 0
            {
                next = Some(layers::ip_protocol_layer(self.ipv4.protocol));
            }

            data = payload;
            if data.is_empty() {
                return Ok(DecodeOutcome::Complete);
            }

            let next = match next {
                Some(l) => l,
                None => return Ok(DecodeOutcome::Complete),
            };
            if !self.registered(next) {
                return Ok(DecodeOutcome::Unsupported(next));
            }
            layer = next;
        }
    }

    fn decode_one<'a>(&mut self, layer: LayerClass, data: &'a [u8]) -> LayerResult<'a> {
        match layer {
            LayerClass::Ethernet => self.ethernet.decode(data),
            LayerClass::LinuxSll => self.linux_sll.decode(data),
            LayerClass::Dot1q => self.dot1q.decode(data),
            LayerClass::Ipv4 => self.ipv4.decode(data),
            LayerClass::Tcp => self.tcp.decode(data),
            LayerClass::Udp => self.udp.decode(data),
            LayerClass::Dns => self.dns.decode(data),
            LayerClass::Icmpv4 => self.icmpv4.decode(data),
            LayerClass::Gre => self.gre.decode(data),
            LayerClass::Llc => self.llc.decode(data),
            LayerClass::Arp => self.arp.decode(data),
            LayerClass::Payload => self.payload.decode(data),
            _ => Err(DecodeError::Malformed {
                layer: "registry",
                reason: "no parser bound to layer type",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::layers::testutil::{
        eth_frame, ipv4_header, udp_header, ETHERTYPE_IPV4, ETHERTYPE_LLDP, ETHERTYPE_VLAN,
    };

    #[test]
    fn test_decode_eth_ipv4_udp_chain() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = Vec::new();

        let udp = udp_header(5353, 53, &[0u8; 0]);
        let ip = ipv4_header("10.0.0.1", "8.8.8.8", 17, 0, false, &udp);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        let outcome = dec
            .decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap();

        assert_eq!(outcome, DecodeOutcome::Complete);
        assert_eq!(
            decoded,
            vec![LayerClass::Ethernet, LayerClass::Ipv4, LayerClass::Udp]
        );
        assert_eq!(dec.ipv4.src.to_string(), "10.0.0.1");
        assert_eq!(dec.ipv4.dst.to_string(), "8.8.8.8");
        assert_eq!(dec.udp.src_port, 5353);
        assert_eq!(dec.udp.dst_port, 53);
    }

    #[test]
    fn test_decode_l3_only_stops_at_transport() {
        let mut dec = LayerDecoder::new(false);
        let mut decoded = Vec::new();

        let udp = udp_header(1000, 2000, &[1, 2, 3]);
        let ip = ipv4_header("192.168.0.1", "192.168.0.2", 17, 0, false, &udp);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        let outcome = dec
            .decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap();

        assert_eq!(outcome, DecodeOutcome::Unsupported(LayerClass::Udp));
        assert_eq!(decoded, vec![LayerClass::Ethernet, LayerClass::Ipv4]);
    }

    #[test]
    fn test_decode_vlan_chain() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = Vec::new();

        let udp = udp_header(68, 67, &[0u8; 0]);
        let ip = ipv4_header("10.1.1.1", "10.1.1.2", 17, 0, false, &udp);
        let mut vlan = vec![0x00, 0x64]; // vid 100
        vlan.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        vlan.extend_from_slice(&ip);
        let pkt = eth_frame(ETHERTYPE_VLAN, &vlan);

        dec.decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap();
        assert_eq!(
            decoded,
            vec![
                LayerClass::Ethernet,
                LayerClass::Dot1q,
                LayerClass::Ipv4,
                LayerClass::Udp
            ]
        );
    }

    #[test]
    fn test_decode_first_fragment_reaches_transport() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = Vec::new();

        // MoreFragments set, offset zero: the embedded UDP header must be
        // decoded so the first fragment is accounted at L4.
        let udp = udp_header(40000, 9999, &[0xde, 0xad]);
        let ip = ipv4_header("172.16.0.1", "172.16.0.2", 17, 0, true, &udp);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        dec.decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap();
        assert!(decoded.contains(&LayerClass::Ipv4));
        assert!(decoded.contains(&LayerClass::Udp));
    }

    #[test]
    fn test_decode_later_fragment_is_unsupported() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = Vec::new();

        let ip = ipv4_header("172.16.0.1", "172.16.0.2", 17, 185, true, &[0u8; 16]);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        let outcome = dec
            .decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap();
        assert_eq!(outcome, DecodeOutcome::Unsupported(LayerClass::Fragment));
        assert_eq!(decoded, vec![LayerClass::Ethernet, LayerClass::Ipv4]);
    }

    #[test]
    fn test_decode_unknown_ethertype() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = Vec::new();

        let pkt = eth_frame(ETHERTYPE_LLDP, &[0u8; 8]);
        let outcome = dec
            .decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap();

        assert_eq!(
            outcome,
            DecodeOutcome::Unsupported(LayerClass::LinkLayerDiscovery)
        );
        assert_eq!(decoded, vec![LayerClass::Ethernet]);
    }

    #[test]
    fn test_decode_empty_buffer_emits_no_layers() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = vec![LayerClass::Payload];

        let outcome = dec
            .decode_layers(&[], LayerClass::Ethernet, &mut decoded)
            .unwrap();
        assert_eq!(outcome, DecodeOutcome::Complete);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_truncated_ipv4_keeps_link_layer() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = Vec::new();

        let pkt = eth_frame(ETHERTYPE_IPV4, &[0x45, 0x00, 0x00]);
        let err = dec
            .decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap_err();

        assert!(err.to_string().contains("IPv4"));
        assert_eq!(decoded, vec![LayerClass::Ethernet]);
    }

    #[test]
    fn test_first_layer_mapping() {
        let dec = LayerDecoder::new(false);
        assert_eq!(
            dec.first_layer(LinkKind::Ethernet),
            Some(LayerClass::Ethernet)
        );
        assert_eq!(
            dec.first_layer(LinkKind::LinuxSll),
            Some(LayerClass::LinuxSll)
        );
        assert_eq!(dec.first_layer(LinkKind::Raw), Some(LayerClass::Ipv4));
    }

    #[test]
    fn test_igmp_terminates_without_transport_layer() {
        let mut dec = LayerDecoder::new(true);
        let mut decoded = Vec::new();

        let ip = ipv4_header("10.0.0.5", "224.0.0.1", 2, 0, false, &[0x11, 0x64, 0x00, 0x00]);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        let outcome = dec
            .decode_layers(&pkt, LayerClass::Ethernet, &mut decoded)
            .unwrap();
        assert_eq!(outcome, DecodeOutcome::Unsupported(LayerClass::Igmp));
        assert_eq!(decoded, vec![LayerClass::Ethernet, LayerClass::Ipv4]);
    }
}
