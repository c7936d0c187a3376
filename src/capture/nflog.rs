//! Kernel netfilter-log capture driver
//!
//! Binds a multicast group on the nflog netlink interface and dispatches
//! each logged packet to a callback. Packets arrive with no link header;
//! decoding starts at IPv4. Typical iptables setup:
//!
//! ```text
//! iptables -t raw -A PREROUTING -i eth1 -j NFLOG --nflog-group 2 --nflog-range 64 --nflog-threshold 10
//! iptables -t mangle -A POSTROUTING -o eth1 -j NFLOG --nflog-group 5 --nflog-range 64 --nflog-threshold 10
//! ```

use crate::capture::DriverError;
use crate::core::session::{CaptureSession, PacketScratch};
use crate::decoder::{LayerClass, LayerDecoder};
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// NFULNL_COPY_PACKET
const COPY_PACKET_MODE: u8 = 0x02;
/// NFULNL_CFG_F_SEQ: per-packet sequence numbers for gap detection
const CFG_FLAG_SEQ: u16 = 0x0001;
/// Copy range passed with the copy mode
const COPY_RANGE: u32 = 0xffff;

const RECV_BUFFER_SIZE: usize = 128 * 1024;
const RECV_TIMEOUT_SECS: i64 = 1;

mod ffi {
    use std::os::raw::{c_char, c_int, c_void};

    #[repr(C)]
    pub struct NflogHandle {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct NflogGroupHandle {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct NflogData {
        _private: [u8; 0],
    }

    pub type NflogCallback = extern "C" fn(
        group: *mut NflogGroupHandle,
        nfmsg: *mut c_void,
        nfad: *mut NflogData,
        data: *mut c_void,
    ) -> c_int;

    extern "C" {
        pub fn nflog_open() -> *mut NflogHandle;
        pub fn nflog_close(handle: *mut NflogHandle) -> c_int;
        pub fn nflog_bind_pf(handle: *mut NflogHandle, pf: u16) -> c_int;
        pub fn nflog_bind_group(handle: *mut NflogHandle, num: u16) -> *mut NflogGroupHandle;
        pub fn nflog_unbind_group(group: *mut NflogGroupHandle) -> c_int;
        pub fn nflog_set_mode(group: *mut NflogGroupHandle, mode: u8, range: u32) -> c_int;
        pub fn nflog_set_flags(group: *mut NflogGroupHandle, flags: u16) -> c_int;
        pub fn nflog_callback_register(
            group: *mut NflogGroupHandle,
            callback: NflogCallback,
            data: *mut c_void,
        ) -> c_int;
        pub fn nflog_handle_packet(
            handle: *mut NflogHandle,
            buf: *mut c_char,
            len: c_int,
        ) -> c_int;
        pub fn nflog_fd(handle: *mut NflogHandle) -> c_int;
        pub fn nflog_get_payload(nfad: *mut NflogData, data: *mut *mut c_char) -> c_int;
        pub fn nflog_get_seq(nfad: *mut NflogData, seq: *mut u32) -> c_int;
    }
}

/// Callback receiving `(payload, sequence)` for each logged packet.
pub type PacketCallback = Box<dyn FnMut(&[u8], u32) + Send>;

extern "C" fn dispatch_packet(
    _group: *mut ffi::NflogGroupHandle,
    _nfmsg: *mut c_void,
    nfad: *mut ffi::NflogData,
    data: *mut c_void,
) -> c_int {
    let callback = unsafe { &mut *(data as *mut PacketCallback) };

    let mut payload: *mut c_char = std::ptr::null_mut();
    let len = unsafe { ffi::nflog_get_payload(nfad, &mut payload) };
    if len < 0 || payload.is_null() {
        return 0;
    }
    let bytes = unsafe { std::slice::from_raw_parts(payload as *const u8, len as usize) };

    let mut seq: u32 = 0;
    unsafe {
        ffi::nflog_get_seq(nfad, &mut seq);
    }

    callback(bytes, seq);
    0
}

/// Handle to one bound nflog group.
pub struct NflogDriver {
    handle: *mut ffi::NflogHandle,
    group: *mut ffi::NflogGroupHandle,
    fd: c_int,
    group_id: u16,
    // Heap slot registered with the C library; must outlive the group
    // binding, so it lives here and not on the run loop's stack.
    _callback: Box<PacketCallback>,
}

// The raw handles are only touched from the thread running the recv loop.
unsafe impl Send for NflogDriver {}

impl NflogDriver {
    pub fn open(group_id: u16, on_packet: PacketCallback) -> Result<Self, DriverError> {
        unsafe {
            let handle = ffi::nflog_open();
            if handle.is_null() {
                return Err(DriverError::Nflog("nflog_open failed".to_string()));
            }

            if ffi::nflog_bind_pf(handle, libc::AF_INET as u16) < 0 {
                ffi::nflog_close(handle);
                return Err(DriverError::Nflog("nflog_bind_pf failed".to_string()));
            }

            let group = ffi::nflog_bind_group(handle, group_id);
            if group.is_null() {
                ffi::nflog_close(handle);
                return Err(DriverError::Nflog(format!(
                    "nflog_bind_group failed for group {}",
                    group_id
                )));
            }

            if ffi::nflog_set_mode(group, COPY_PACKET_MODE, COPY_RANGE) < 0 {
                ffi::nflog_unbind_group(group);
                ffi::nflog_close(handle);
                return Err(DriverError::Nflog("nflog_set_mode failed".to_string()));
            }

            if ffi::nflog_set_flags(group, CFG_FLAG_SEQ) < 0 {
                warn!(
                    "nflog group {}: sequence numbers unavailable, gaps will not be detected",
                    group_id
                );
            }

            let mut callback = Box::new(on_packet);
            ffi::nflog_callback_register(
                group,
                dispatch_packet,
                &mut *callback as *mut PacketCallback as *mut c_void,
            );

            let fd = ffi::nflog_fd(handle);
            // Receive timeout so the loop can poll cancellation.
            let tv = libc::timeval {
                tv_sec: RECV_TIMEOUT_SECS,
                tv_usec: 0,
            };
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );

            Ok(Self {
                handle,
                group,
                fd,
                group_id,
                _callback: callback,
            })
        }
    }

    /// Blocking receive loop; returns once cancelled.
    pub fn run(&mut self, cancel: CancellationToken) {
        info!("nflog capture started on group {}", self.group_id);

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        while !cancel.is_cancelled() {
            let received = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0)
            };
            if received < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                    _ => {
                        warn!("nflog recv failed on group {}: {}", self.group_id, err);
                        continue;
                    }
                }
            }
            if received == 0 {
                continue;
            }

            unsafe {
                ffi::nflog_handle_packet(
                    self.handle,
                    buf.as_mut_ptr() as *mut c_char,
                    received as c_int,
                );
            }
        }

        info!("nflog capture exit on group {}", self.group_id);
    }
}

impl Drop for NflogDriver {
    fn drop(&mut self) {
        unsafe {
            ffi::nflog_unbind_group(self.group);
            ffi::nflog_close(self.handle);
        }
    }
}

/// Bind a group and wire it to a capture session.
///
/// Kernel-logged packets start at the IPv4 header. Sequence gaps are
/// logged with their delta; nothing is recovered.
pub fn open_session_driver(
    session: Arc<CaptureSession>,
    group_id: u16,
) -> Result<NflogDriver, DriverError> {
    let mut decoder = LayerDecoder::new(session.decode_l4);
    let mut scratch = PacketScratch::default();
    let mut expected_seq: Option<u32> = None;

    let callback: PacketCallback = Box::new(move |payload, seq| {
        if let Some(expected) = expected_seq {
            if seq != expected {
                warn!(
                    "nflog sequence gap on group {}: expected {}, got {} ({} packets lost)",
                    group_id,
                    expected,
                    seq,
                    seq.wrapping_sub(expected)
                );
            }
        }
        expected_seq = Some(seq.wrapping_add(1));

        session.handle_packet(&mut decoder, &mut scratch, payload, LayerClass::Ipv4);
    });

    NflogDriver::open(group_id, callback)
}
