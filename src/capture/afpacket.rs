//! Memory-mapped raw-socket capture driver
//!
//! Uses libpcap's TPACKET ring on Linux, sized with the classic
//! frame/block arithmetic, and selects direction with the `inbound` /
//! `outbound` BPF programs instead of a kernel direction filter.

use crate::capture::pcap::{link_kind_of, DEFAULT_SNAPLEN, READ_TIMEOUT_MS};
use crate::capture::{Direction, DriverError, LinkKind, PacketDriver};
use pcap::{Active, Capture};

pub const DEFAULT_MMAP_BUFFER_SIZE_MB: usize = 16;

/// Frames per block; the kernel default.
const FRAMES_PER_BLOCK: usize = 128;

/// Compute the ring geometry so the mapped buffer is close to but no
/// larger than `target_size_mb`. The block size must be divisible by both
/// the frame size and the page size.
pub fn compute_ring_size(
    target_size_mb: usize,
    snaplen: usize,
    page_size: usize,
) -> Result<(usize, usize, usize), DriverError> {
    let frame_size = if snaplen < page_size {
        page_size / (page_size / snaplen)
    } else {
        (snaplen / page_size + 1) * page_size
    };

    let block_size = frame_size * FRAMES_PER_BLOCK;
    let num_blocks = (target_size_mb * 1024 * 1024) / block_size;

    if num_blocks == 0 {
        return Err(DriverError::Interface(
            "interface buffer size is too small".to_string(),
        ));
    }

    Ok((frame_size, block_size, num_blocks))
}

pub struct AfpacketDriver {
    handle: Capture<Active>,
    link_kind: LinkKind,
}

impl AfpacketDriver {
    pub fn open(iface: &str, direction: Direction) -> Result<Self, DriverError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let (_frame_size, block_size, num_blocks) =
            compute_ring_size(DEFAULT_MMAP_BUFFER_SIZE_MB, DEFAULT_SNAPLEN as usize, page_size)?;

        let mut handle = Capture::from_device(iface)?
            .promisc(true)
            .snaplen(DEFAULT_SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .buffer_size((num_blocks * block_size) as i32)
            .open()?;

        let bpf_filter = match direction {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        };
        handle.filter(bpf_filter, true)?;

        let link_kind = link_kind_of(handle.get_datalink())?;

        Ok(Self { handle, link_kind })
    }
}

impl PacketDriver for AfpacketDriver {
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
