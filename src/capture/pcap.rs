//! libpcap capture driver

use crate::capture::{Direction, DriverError, LinkKind, PacketDriver};
use pcap::{Active, Capture, Linktype};

pub const DEFAULT_SNAPLEN: i32 = 65535;

/// Read timeout so capture loops wake up to poll cancellation.
pub(crate) const READ_TIMEOUT_MS: i32 = 1000;

/// Live capture over libpcap with a kernel-side direction filter.
pub struct LibpcapDriver {
    handle: Capture<Active>,
    link_kind: LinkKind,
}

impl LibpcapDriver {
    pub fn open(iface: &str, bpf_filter: &str, direction: Direction) -> Result<Self, DriverError> {
        let mut handle = Capture::from_device(iface)?
            .promisc(true)
            .snaplen(DEFAULT_SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .open()?;

        handle.filter(bpf_filter, true)?;
        handle.direction(match direction {
            Direction::Inbound => pcap::Direction::In,
            Direction::Outbound => pcap::Direction::Out,
        })?;

        let link_kind = link_kind_of(handle.get_datalink())?;

        Ok(Self { handle, link_kind })
    }
}

impl PacketDriver for LibpcapDriver {
    fn read_packet(&mut self) -> Result<&[u8], DriverError> {
        match self.handle.next_packet() {
            Ok(packet) => Ok(packet.data),
            Err(pcap::Error::TimeoutExpired) => Err(DriverError::Timeout),
            Err(err) => Err(DriverError::Pcap(err)),
        }
    }

    fn link_kind(&self) -> LinkKind {
        self.link_kind
    }

    fn close(&mut self) {
        // The pcap handle is released on drop.
    }
}

pub(crate) fn link_kind_of(link_type: Linktype) -> Result<LinkKind, DriverError> {
    // DLT_EN10MB, DLT_LINUX_SLL, DLT_RAW / DLT_IPV4
    match link_type.0 {
        1 => Ok(LinkKind::Ethernet),
        113 => Ok(LinkKind::LinuxSll),
        12 | 101 | 228 => Ok(LinkKind::Raw),
        other => Err(DriverError::Interface(format!(
            "unsupported link type {}",
            other
        ))),
    }
}
