//! Decode-in-place header parsers
//!
//! Each layer struct is allocated once per decoder and refilled for every
//! packet. Parsers validate with the pnet packet views where pnet models
//! the protocol; Linux cooked capture, LLC, the GRE option words and the
//! DNS header are read by hand.

use super::{DecodeError, LayerClass, LayerResult};
use pnet::packet::arp::ArpPacket;
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;
use std::net::Ipv4Addr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_LLDP: u16 = 0x88cc;

const ETHERNET_HEADER_LEN: usize = 14;
const SLL_HEADER_LEN: usize = 16;
const VLAN_HEADER_LEN: usize = 4;
const UDP_HEADER_LEN: usize = 8;
const ICMPV4_HEADER_LEN: usize = 8;
const LLC_HEADER_LEN: usize = 3;
const DNS_HEADER_LEN: usize = 12;
const ARP_IPV4_LEN: usize = 28;

/// Map an EtherType (or an 802.3 length field) to the layer it carries.
pub(crate) fn ethertype_layer(ethertype: u16) -> LayerClass {
    match ethertype {
        ETHERTYPE_IPV4 => LayerClass::Ipv4,
        ETHERTYPE_ARP => LayerClass::Arp,
        ETHERTYPE_VLAN => LayerClass::Dot1q,
        ETHERTYPE_IPV6 => LayerClass::Ipv6,
        ETHERTYPE_LLDP => LayerClass::LinkLayerDiscovery,
        // 802.3: values up to 1500 are a payload length, not a type.
        len if len <= 1500 => LayerClass::Llc,
        other => LayerClass::Other(other),
    }
}

/// Map an IPv4 protocol number to the layer it carries.
pub(crate) fn ip_protocol_layer(protocol: u8) -> LayerClass {
    match protocol {
        1 => LayerClass::Icmpv4,
        2 => LayerClass::Igmp,
        6 => LayerClass::Tcp,
        17 => LayerClass::Udp,
        41 => LayerClass::Ipv6,
        47 => LayerClass::Gre,
        112 => LayerClass::Vrrp,
        other => LayerClass::Other(other as u16),
    }
}

#[derive(Debug, Default)]
pub struct EthernetLayer {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ethertype: u16,
}

impl EthernetLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        let pkt = EthernetPacket::new(data)
            .ok_or_else(|| DecodeError::truncated("Ethernet", ETHERNET_HEADER_LEN, data.len()))?;

        let dst = pkt.get_destination();
        self.dst_mac = [dst.0, dst.1, dst.2, dst.3, dst.4, dst.5];
        let src = pkt.get_source();
        self.src_mac = [src.0, src.1, src.2, src.3, src.4, src.5];
        self.ethertype = pkt.get_ethertype().0;

        let mut payload = &data[ETHERNET_HEADER_LEN..];
        if self.ethertype as usize <= 1500 {
            // 802.3 frames bound the payload by the length field.
            let len = (self.ethertype as usize).min(payload.len());
            payload = &payload[..len];
        }

        Ok((Some(ethertype_layer(self.ethertype)), payload))
    }
}

/// Linux cooked capture (SLL) header, used by the "any" pseudo interface.
#[derive(Debug, Default)]
pub struct LinuxSllLayer {
    pub packet_type: u16,
    pub addr_type: u16,
    pub protocol: u16,
}

impl LinuxSllLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        if data.len() < SLL_HEADER_LEN {
            return Err(DecodeError::truncated("LinuxSLL", SLL_HEADER_LEN, data.len()));
        }

        self.packet_type = u16::from_be_bytes([data[0], data[1]]);
        self.addr_type = u16::from_be_bytes([data[2], data[3]]);
        self.protocol = u16::from_be_bytes([data[14], data[15]]);

        Ok((
            Some(ethertype_layer(self.protocol)),
            &data[SLL_HEADER_LEN..],
        ))
    }
}

#[derive(Debug, Default)]
pub struct Dot1qLayer {
    pub vlan_id: u16,
    pub ethertype: u16,
}

impl Dot1qLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        let pkt = VlanPacket::new(data)
            .ok_or_else(|| DecodeError::truncated("Dot1Q", VLAN_HEADER_LEN, data.len()))?;

        self.vlan_id = pkt.get_vlan_identifier();
        self.ethertype = pkt.get_ethertype().0;

        Ok((
            Some(ethertype_layer(self.ethertype)),
            &data[VLAN_HEADER_LEN..],
        ))
    }
}

#[derive(Debug)]
pub struct Ipv4Layer {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub total_length: u16,
    pub protocol: u8,
    pub more_fragments: bool,
    pub fragment_offset: u16,
}

impl Default for Ipv4Layer {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            total_length: 0,
            protocol: 0,
            more_fragments: false,
            fragment_offset: 0,
        }
    }
}

impl Ipv4Layer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        let pkt = Ipv4Packet::new(data)
            .ok_or_else(|| DecodeError::truncated("IPv4", 20, data.len()))?;

        if pkt.get_version() != 4 {
            return Err(DecodeError::Malformed {
                layer: "IPv4",
                reason: "version field is not 4",
            });
        }

        let header_len = pkt.get_header_length() as usize * 4;
        if header_len < 20 || data.len() < header_len {
            return Err(DecodeError::Malformed {
                layer: "IPv4",
                reason: "header length out of range",
            });
        }

        self.src = pkt.get_source();
        self.dst = pkt.get_destination();
        self.total_length = pkt.get_total_length();
        self.protocol = pkt.get_next_level_protocol().0;
        // flags field: bit 0 is MF, bit 1 is DF.
        self.more_fragments = pkt.get_flags() & 0b001 != 0;
        self.fragment_offset = pkt.get_fragment_offset();

        let end = (self.total_length as usize).clamp(header_len, data.len());
        let payload = &data[header_len..end];

        let next = if self.fragment_offset != 0 || self.more_fragments {
            // Reassembly is not done here; the caller decides whether a
            // first fragment still gets its transport header decoded.
            Some(LayerClass::Fragment)
        } else {
            Some(ip_protocol_layer(self.protocol))
        };

        Ok((next, payload))
    }
}

#[derive(Debug, Default)]
pub struct TcpLayer {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload length of the segment as captured.
    pub segment_len: usize,
    pub header_len: usize,
}

impl TcpLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        let pkt =
            TcpPacket::new(data).ok_or_else(|| DecodeError::truncated("TCP", 20, data.len()))?;

        let header_len = pkt.get_data_offset() as usize * 4;
        if header_len < 20 || data.len() < header_len {
            return Err(DecodeError::Malformed {
                layer: "TCP",
                reason: "data offset out of range",
            });
        }

        self.src_port = pkt.get_source();
        self.dst_port = pkt.get_destination();
        self.segment_len = data.len();
        self.header_len = header_len;

        let next = match (self.src_port, self.dst_port) {
            (53, _) | (_, 53) => Some(LayerClass::Dns),
            (443, _) | (_, 443) => Some(LayerClass::Tls),
            _ => Some(LayerClass::Payload),
        };

        Ok((next, &data[header_len..]))
    }
}

#[derive(Debug, Default)]
pub struct UdpLayer {
    pub src_port: u16,
    pub dst_port: u16,
    /// Value of the UDP length field (header plus payload).
    pub length: u16,
}

impl UdpLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        let pkt = UdpPacket::new(data)
            .ok_or_else(|| DecodeError::truncated("UDP", UDP_HEADER_LEN, data.len()))?;

        self.src_port = pkt.get_source();
        self.dst_port = pkt.get_destination();
        self.length = pkt.get_length();

        let next = match (self.src_port, self.dst_port) {
            (53, _) | (_, 53) | (5353, _) | (_, 5353) => Some(LayerClass::Dns),
            (67, _) | (_, 67) | (68, _) | (_, 68) => Some(LayerClass::Dhcpv4),
            (123, _) | (_, 123) => Some(LayerClass::Ntp),
            _ => Some(LayerClass::Payload),
        };

        Ok((next, &data[UDP_HEADER_LEN..]))
    }
}

/// DNS message header; questions and records are not walked.
#[derive(Debug, Default)]
pub struct DnsLayer {
    pub id: u16,
    pub is_response: bool,
    pub questions: u16,
    pub answers: u16,
}

impl DnsLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        if data.len() < DNS_HEADER_LEN {
            return Err(DecodeError::truncated("DNS", DNS_HEADER_LEN, data.len()));
        }

        self.id = u16::from_be_bytes([data[0], data[1]]);
        self.is_response = data[2] & 0x80 != 0;
        self.questions = u16::from_be_bytes([data[4], data[5]]);
        self.answers = u16::from_be_bytes([data[6], data[7]]);

        Ok((None, &data[data.len()..]))
    }
}

#[derive(Debug, Default)]
pub struct Icmpv4Layer {
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Header plus payload length of the message as captured.
    pub message_len: usize,
}

impl Icmpv4Layer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        let pkt = IcmpPacket::new(data)
            .ok_or_else(|| DecodeError::truncated("ICMPv4", ICMPV4_HEADER_LEN, data.len()))?;

        self.icmp_type = pkt.get_icmp_type().0;
        self.icmp_code = pkt.get_icmp_code().0;
        self.message_len = data.len();

        let offset = ICMPV4_HEADER_LEN.min(data.len());
        Ok((Some(LayerClass::Payload), &data[offset..]))
    }
}

#[derive(Debug, Default)]
pub struct GreLayer {
    pub protocol: u16,
    pub header_len: usize,
}

impl GreLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        if data.len() < 4 {
            return Err(DecodeError::truncated("GRE", 4, data.len()));
        }

        let flags = u16::from_be_bytes([data[0], data[1]]);
        self.protocol = u16::from_be_bytes([data[2], data[3]]);

        // Checksum/routing share one option word; key and sequence have
        // their own.
        let mut header_len = 4;
        if flags & 0xc000 != 0 {
            header_len += 4;
        }
        if flags & 0x2000 != 0 {
            header_len += 4;
        }
        if flags & 0x1000 != 0 {
            header_len += 4;
        }
        if data.len() < header_len {
            return Err(DecodeError::truncated("GRE", header_len, data.len()));
        }
        self.header_len = header_len;

        Ok((Some(ethertype_layer(self.protocol)), &data[header_len..]))
    }
}

#[derive(Debug, Default)]
pub struct LlcLayer {
    pub dsap: u8,
    pub ssap: u8,
    pub control: u8,
}

impl LlcLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        if data.len() < LLC_HEADER_LEN {
            return Err(DecodeError::truncated("LLC", LLC_HEADER_LEN, data.len()));
        }

        self.dsap = data[0];
        self.ssap = data[1];
        self.control = data[2];

        let next = if self.dsap == 0xaa && self.ssap == 0xaa {
            Some(LayerClass::Snap)
        } else if self.dsap == 0x42 {
            Some(LayerClass::Stp)
        } else {
            Some(LayerClass::Payload)
        };

        Ok((next, &data[LLC_HEADER_LEN..]))
    }
}

#[derive(Debug, Default)]
pub struct ArpLayer {
    pub operation: u16,
    pub sender_addr: Option<Ipv4Addr>,
    pub target_addr: Option<Ipv4Addr>,
}

impl ArpLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        let pkt = ArpPacket::new(data)
            .ok_or_else(|| DecodeError::truncated("ARP", ARP_IPV4_LEN, data.len()))?;

        self.operation = pkt.get_operation().0;
        self.sender_addr = Some(pkt.get_sender_proto_addr());
        self.target_addr = Some(pkt.get_target_proto_addr());

        Ok((None, &data[data.len()..]))
    }
}

/// Terminal layer; swallows whatever is left of the buffer.
#[derive(Debug, Default)]
pub struct PayloadLayer {
    pub len: usize,
}

impl PayloadLayer {
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> LayerResult<'a> {
        self.len = data.len();
        Ok((None, &data[data.len()..]))
    }
}

#[cfg(test)]
pub mod testutil {
    pub use super::{ETHERTYPE_IPV4, ETHERTYPE_LLDP, ETHERTYPE_VLAN};

    /// Ethernet frame with fixed MACs around `payload`.
    pub fn eth_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14 + payload.len());
        buf.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        buf.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
        buf.extend_from_slice(&ethertype.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Minimal 20-byte IPv4 header in front of `payload`.
    ///
    /// `frag_offset` is in 8-byte units as on the wire.
    pub fn ipv4_header(
        src: &str,
        dst: &str,
        protocol: u8,
        frag_offset: u16,
        more_fragments: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let src: std::net::Ipv4Addr = src.parse().unwrap();
        let dst: std::net::Ipv4Addr = dst.parse().unwrap();
        let total_len = (20 + payload.len()) as u16;

        let mut flags_frag = frag_offset & 0x1fff;
        if more_fragments {
            flags_frag |= 0x2000;
        }

        let mut buf = Vec::with_capacity(20 + payload.len());
        buf.push(0x45);
        buf.push(0x00);
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(&flags_frag.to_be_bytes());
        buf.push(64);
        buf.push(protocol);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());
        buf.extend_from_slice(payload);
        buf
    }

    /// IPv4 header with an explicit total-length field, for packets whose
    /// length field disagrees with the captured bytes.
    pub fn ipv4_header_with_len(
        src: &str,
        dst: &str,
        protocol: u8,
        total_len: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = ipv4_header(src, dst, protocol, 0, false, payload);
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf
    }

    /// UDP header in front of `payload`, length field covering both.
    pub fn udp_header(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&src_port.to_be_bytes());
        buf.extend_from_slice(&dst_port.to_be_bytes());
        buf.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(payload);
        buf
    }

    /// TCP header (no options) in front of `payload`.
    pub fn tcp_header(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + payload.len());
        buf.extend_from_slice(&src_port.to_be_bytes());
        buf.extend_from_slice(&dst_port.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // seq
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // ack
        buf.push(0x50); // data offset 5
        buf.push(0x18); // PSH|ACK
        buf.extend_from_slice(&[0xff, 0xff]); // window
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // checksum, urgent
        buf.extend_from_slice(payload);
        buf
    }
}
