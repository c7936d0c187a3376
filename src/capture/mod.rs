//! Packet capture drivers for flowtop
//!
//! This module defines the driver contract shared by the libpcap, afpacket
//! and nflog capture engines.

pub mod afpacket;
pub mod nflog;
pub mod pcap;

use thiserror::Error;

pub const LIBPCAP_ENGINE_NAME: &str = "libpcap";
pub const AFPACKET_ENGINE_NAME: &str = "afpacket";
pub const NFLOG_ENGINE_NAME: &str = "nflog";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("pcap error: {0}")]
    Pcap(#[from] ::pcap::Error),

    #[error("read timed out")]
    Timeout,

    #[error("interface error: {0}")]
    Interface(String),

    #[error("nflog error: {0}")]
    Nflog(String),
}

/// Traffic direction a capture session is attached to.
///
/// The direction is enforced at the driver level (kernel direction filter,
/// BPF program or iptables hook); sessions use it to decide whether to swap
/// the fingerprint endpoints so both directions of a flow share one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

/// Link layer a driver hands its packets off with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    LinuxSll,
    /// No link header; the buffer starts at the IPv4 header.
    Raw,
}

/// Capture driver contract shared by the packet engines.
///
/// `read_packet` may return a view into driver-owned storage; the returned
/// slice is only valid until the next call, which the borrow on `self`
/// enforces.
pub trait PacketDriver: Send {
    /// Block until the next packet, a read timeout, or a read error.
    ///
    /// Timeouts are the cancellation poll point for capture loops and are
    /// reported as [`DriverError::Timeout`].
    fn read_packet(&mut self) -> Result<&[u8], DriverError>;

    /// Link layer of the packets this driver produces.
    fn link_kind(&self) -> LinkKind;

    /// Release the underlying handle.
    fn close(&mut self);
}
