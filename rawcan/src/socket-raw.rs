/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/can.html#how-to-use-socketcan
 *    https://www.kernel.org/doc/html/latest/networking/can.html#raw-protocol-sockets-with-can-filters-sock-raw
 *
*/
use bitflags::bitflags;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::prelude::*;

// linux/can.h + linux/can/raw.h values, fixed ABI
const PF_CAN: libc::c_int = 29;
const AF_CAN: libc::c_int = 29;
const CAN_RAW: libc::c_int = 1;
const SOL_CAN_BASE: libc::c_int = 100;
const SOL_CAN_RAW: libc::c_int = SOL_CAN_BASE + CAN_RAW;
const CAN_RAW_FILTER: libc::c_int = 1;
const CAN_RAW_ERR_FILTER: libc::c_int = 2;
const CAN_RAW_RECV_OWN_MSGS: libc::c_int = 4;

/// Inverts a filter rule when or-ed into its can_id
pub const CAN_INV_FILTER: SockCanId = 0x2000_0000;

// linux/can/error.h error class bits
const CAN_ERR_TX_TIMEOUT: SockCanId = 0x0001;
const CAN_ERR_BUSOFF: SockCanId = 0x0040;
const CAN_ERR_BUSERROR: SockCanId = 0x0080;
const CAN_ERR_RESTARTED: SockCanId = 0x0100;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct FilterMask: SockCanId {
        /// SFF_MASK valid bits in standard frame id
        const SFF_MASK = CAN_SFF_MASK;
        /// EFF_MASK valid bits in extended frame id
        const EFF_MASK = CAN_EFF_MASK;
        /// EFF_FLAG indicate 29 bit extended format
        const EFF_FLAG = CAN_EFF_FLAG;
        /// RTR_FLAG remote transmission request flag
        const RTR_FLAG = CAN_RTR_FLAG;
        /// ERR_FLAG error flag
        const ERR_FLAG = CAN_ERR_FLAG;
        /// ERR_MASK valid bits in error frame
        const ERR_MASK = CAN_ERR_MASK;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct CanErrorMask: SockCanId {
        const TX_TIMEOUT = CAN_ERR_TX_TIMEOUT;
        const BUS_OFF = CAN_ERR_BUSOFF;
        const BUS_ERROR = CAN_ERR_BUSERROR;
        const BUS_RESTARTED = CAN_ERR_RESTARTED;
    }
}

/// struct sockaddr_can reduced to the members raw_bind checks
#[repr(C)]
struct CanAddr {
    can_family: libc::sa_family_t,
    can_ifindex: libc::c_int,
    rx_id: SockCanId,
    tx_id: SockCanId,
}

/// struct can_filter from linux/can.h
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FilterRule {
    can_id: SockCanId,
    can_mask: SockCanId,
}

/// Outcome of one receive attempt.
///
/// Would-block and malformed frames are ordinary outcomes here, not errors:
/// `NoData` is only seen on a non-blocking socket, `Invalid` carries the
/// decoded identifier of a frame that failed validation so the caller can
/// log or count it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanRecv {
    Frame(CanFrame),
    NoData,
    Invalid(CanId),
}

impl CanRecv {
    pub fn get_id(&self) -> Option<CanId> {
        match self {
            CanRecv::Frame(frame) => Some(frame.get_id()),
            CanRecv::Invalid(canid) => Some(*canid),
            CanRecv::NoData => None,
        }
    }
}

pub trait CanIFaceFrom<T> {
    fn map_can_iface(sock: RawFd, iface: T) -> i32;
}

impl CanIFaceFrom<&str> for SockCanRaw {
    fn map_can_iface(_sock: RawFd, iface: &str) -> i32 {
        let cname = match CString::new(iface) {
            Err(_) => return -1,
            Ok(value) => value,
        };
        let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if index == 0 {
            -1
        } else {
            index as i32
        }
    }
}

impl CanIFaceFrom<u32> for SockCanRaw {
    fn map_can_iface(_sock: RawFd, iface: u32) -> i32 {
        iface as i32
    }
}

/// Raw CAN transport: one CAN_RAW socket bound to a single interface.
///
/// The descriptor is closed exactly once when the handle drops, whatever the
/// state of earlier operations. No internal synchronization: one thread per
/// handle, readiness multiplexing happens outside through [`AsRawFd`].
pub struct SockCanRaw {
    sockfd: OwnedFd,
}

impl SockCanRaw {
    /// Open a raw socket and bind it to a CAN interface given by name
    /// ("vcan0") or kernel index.
    pub fn open<T>(candev: T) -> Result<Self, CanError>
    where
        SockCanRaw: CanIFaceFrom<T>,
    {
        let sockfd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };
        if sockfd < 0 {
            return Err(CanError::from_errno("fail-sockcan-open"));
        }
        // owned from here on, closed on any early return
        let sockfd = unsafe { OwnedFd::from_raw_fd(sockfd) };

        let index = SockCanRaw::map_can_iface(sockfd.as_raw_fd(), candev);
        if index < 0 {
            return Err(CanError::from_errno("fail-sockcan-iface"));
        }

        let mut canaddr: CanAddr = unsafe { mem::zeroed() };
        canaddr.can_family = AF_CAN as libc::sa_family_t;
        canaddr.can_ifindex = index;

        let status = unsafe {
            libc::bind(
                sockfd.as_raw_fd(),
                &canaddr as *const CanAddr as *const libc::sockaddr,
                mem::size_of::<CanAddr>() as libc::socklen_t,
            )
        };
        if status < 0 {
            return Err(CanError::from_errno("fail-sockcan-bind"));
        }

        log::debug!("sockcan open ifindex:{} fd:{}", index, sockfd.as_raw_fd());
        Ok(SockCanRaw { sockfd })
    }

    pub fn as_rawfd(&self) -> RawFd {
        self.sockfd.as_raw_fd()
    }

    /// Toggle blocking I/O. Non-blocking sockets turn the receive path into
    /// polling: no data ready yields [`CanRecv::NoData`] instead of
    /// suspending the caller.
    pub fn set_blocking(&mut self, blocking: bool) -> Result<&mut Self, CanError> {
        let current_flag = unsafe { libc::fcntl(self.sockfd.as_raw_fd(), libc::F_GETFL) };
        if current_flag < 0 {
            return Err(CanError::from_errno("can-nonblock-fail"));
        }

        let new_flag = if blocking {
            current_flag & !libc::O_NONBLOCK
        } else {
            current_flag | libc::O_NONBLOCK
        };

        let status = unsafe { libc::fcntl(self.sockfd.as_raw_fd(), libc::F_SETFL, new_flag) };
        if status < 0 {
            return Err(CanError::from_errno("can-nonblock-fail"));
        }
        Ok(self)
    }

    pub fn is_blocking(&self) -> Result<bool, CanError> {
        let flags = unsafe { libc::fcntl(self.sockfd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(CanError::from_errno("can-nonblock-fail"));
        }
        Ok(flags & libc::O_NONBLOCK == 0)
    }

    /// Socket level read/write timeouts in milliseconds; zero leaves the
    /// corresponding direction untouched. An expired read timeout surfaces
    /// as the ordinary [`CanRecv::NoData`] outcome.
    pub fn set_timeout(&mut self, read_ms: i64, write_ms: i64) -> Result<&mut Self, CanError> {
        if read_ms > 0 {
            let timout = libc::timeval {
                tv_sec: (read_ms / 1000) as libc::time_t,
                tv_usec: (read_ms * 1000 % 1_000_000) as libc::suseconds_t,
            };
            self.set_sockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &timout, "can-rcvtimeo-fail")?;
        }

        if write_ms > 0 {
            let timout = libc::timeval {
                tv_sec: (write_ms / 1000) as libc::time_t,
                tv_usec: (write_ms * 1000 % 1_000_000) as libc::suseconds_t,
            };
            self.set_sockopt(libc::SOL_SOCKET, libc::SO_SNDTIMEO, &timout, "can-sndtimeo-fail")?;
        }

        Ok(self)
    }

    /// Deliver frames this handle sent itself (kernel loopback).
    pub fn set_recv_own(&mut self, loopback: bool) -> Result<&mut Self, CanError> {
        let flag: libc::c_int = if loopback { 1 } else { 0 };
        self.set_sockopt(SOL_CAN_RAW, CAN_RAW_RECV_OWN_MSGS, &flag, "can-recv-own-fail")?;
        Ok(self)
    }

    /// Select which error classes the kernel turns into error frames on this
    /// socket.
    pub fn set_monitoring(&mut self, mask: CanErrorMask) -> Result<&mut Self, CanError> {
        let flag: SockCanId = mask.bits();
        self.set_sockopt(SOL_CAN_RAW, CAN_RAW_ERR_FILTER, &flag, "can-err-filter-fail")?;
        Ok(self)
    }

    /// Validate then transmit one frame built from id and payload. Rejects
    /// invalid ids and oversize payloads before touching the socket.
    pub fn send(&self, canid: &CanId, payload: &[u8]) -> Result<(), CanError> {
        if !canid.is_valid() {
            return Err(CanError::InvalidArgument("canid not valid for transmission"));
        }
        if payload.len() > CAN_MAX_DLEN {
            return Err(CanError::InvalidArgument("payload exceeds 8 bytes"));
        }
        let frame = CanFrame::new(*canid, payload)?;
        self.write_frame(&frame)
    }

    /// Push a frame's 16 byte wire image, retrying partial writes and EINTR
    /// until the image is complete or the socket reports a hard error.
    pub fn write_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        let wire = frame.to_wire();
        let mut sent = 0;
        while sent < CAN_MTU {
            let count = unsafe {
                libc::write(
                    self.sockfd.as_raw_fd(),
                    wire[sent..].as_ptr() as *const libc::c_void,
                    CAN_MTU - sent,
                )
            };
            if count < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(CanError::IoFail {
                    uid: "fail-sockcan-write",
                    source: error,
                });
            }
            sent += count as usize;
        }
        log::trace!("sockcan write id:{:#x} len:{}", frame.get_id().get_raw(), frame.get_len());
        Ok(())
    }

    /// Collect exactly one wire frame, looping over as many reads as the
    /// socket needs to deliver all 16 bytes.
    pub fn recv(&self) -> Result<CanRecv, CanError> {
        let mut wire = [0u8; CAN_MTU];
        let mut filled = 0;
        while filled < CAN_MTU {
            let count = unsafe {
                libc::read(
                    self.sockfd.as_raw_fd(),
                    wire[filled..].as_mut_ptr() as *mut libc::c_void,
                    CAN_MTU - filled,
                )
            };
            if count < 0 {
                let error = io::Error::last_os_error();
                match error.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(CanRecv::NoData),
                    _ => {
                        return Err(CanError::IoFail {
                            uid: "fail-sockcan-read",
                            source: error,
                        })
                    }
                }
            }
            if count == 0 {
                return Err(CanError::IoFail {
                    uid: "fail-sockcan-read",
                    source: io::Error::from(io::ErrorKind::UnexpectedEof),
                });
            }
            filled += count as usize;
        }

        let frame = CanFrame::from_wire(&wire);
        if !frame.is_valid() {
            log::debug!("sockcan recv invalid frame id:{:#x}", frame.get_id().get_raw());
            return Ok(CanRecv::Invalid(frame.get_id()));
        }
        Ok(CanRecv::Frame(frame))
    }

    /// Receive into a caller supplied sink of at least 8 bytes. On a valid
    /// frame exactly the declared payload bytes are copied, whatever garbage
    /// the wire padding carried and however large the sink is.
    pub fn recv_into(&self, sink: &mut [u8]) -> Result<CanRecv, CanError> {
        if sink.len() < CAN_MAX_DLEN {
            return Err(CanError::InvalidArgument("receive sink below 8 bytes"));
        }
        let outcome = self.recv()?;
        if let CanRecv::Frame(frame) = &outcome {
            let data = frame.get_data();
            sink[..data.len()].copy_from_slice(data);
        }
        Ok(outcome)
    }

    /// Restrict delivery to one recipient id: numeric value equal and
    /// EFF/RTR flags in the requested state.
    pub fn install_filter(&self, canid: &CanId) -> Result<(), CanError> {
        if !canid.is_valid() {
            return Err(CanError::InvalidArgument("canid not valid for filtering"));
        }
        SockCanFilter::new(1).match_recipient(canid).apply(self)
    }

    fn set_sockopt<T>(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: &T,
        uid: &'static str,
    ) -> Result<(), CanError> {
        let status = unsafe {
            libc::setsockopt(
                self.sockfd.as_raw_fd(),
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if status < 0 {
            return Err(CanError::from_errno(uid));
        }
        Ok(())
    }
}

impl AsRawFd for SockCanRaw {
    fn as_raw_fd(&self) -> RawFd {
        self.sockfd.as_raw_fd()
    }
}

impl FromRawFd for SockCanRaw {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        SockCanRaw {
            sockfd: OwnedFd::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for SockCanRaw {
    fn into_raw_fd(self) -> RawFd {
        self.sockfd.into_raw_fd()
    }
}

/// Builder for the kernel (can_id, can_mask) filter list of a raw socket.
/// Transient: built, applied, discarded.
pub struct SockCanFilter {
    masks: Vec<FilterRule>,
}

impl SockCanFilter {
    pub fn new(size: usize) -> Self {
        SockCanFilter {
            masks: Vec::with_capacity(size),
        }
    }

    /// Each filter contains an internal id and mask. Packets are considered to be matched
    /// by a filter if `received_id & mask == filter_id & mask` holds true.
    pub fn add_whitelist(&mut self, can_id: SockCanId, can_mask: FilterMask) -> &mut Self {
        self.masks.push(FilterRule {
            can_id,
            can_mask: can_mask.bits(),
        });
        self
    }

    pub fn add_blacklist(&mut self, can_id: SockCanId, can_mask: FilterMask) -> &mut Self {
        self.masks.push(FilterRule {
            can_id: can_id | CAN_INV_FILTER,
            can_mask: can_mask.bits(),
        });
        self
    }

    /// Single recipient rule: match the numeric value and require EFF/RTR to
    /// be exactly as carried by `canid`.
    pub fn match_recipient(&mut self, canid: &CanId) -> &mut Self {
        let can_mask = FilterMask::from_bits_retain(canid.get_value())
            | FilterMask::EFF_FLAG
            | FilterMask::RTR_FLAG;
        self.masks.push(FilterRule {
            can_id: canid.get_raw(),
            can_mask: can_mask.bits(),
        });
        self
    }

    pub fn apply(&mut self, sock: &SockCanRaw) -> Result<(), CanError> {
        let status = unsafe {
            libc::setsockopt(
                sock.as_rawfd(),
                SOL_CAN_RAW,
                CAN_RAW_FILTER,
                self.masks.as_ptr() as *const libc::c_void,
                (mem::size_of::<FilterRule>() * self.masks.len()) as libc::socklen_t,
            )
        };
        if status < 0 {
            return Err(CanError::from_errno("fail-sockcan-filter"));
        }
        log::debug!("sockcan filter applied rules:{}", self.masks.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    // AF_UNIX stream pair: a byte stream end makes partial reads and writes
    // genuinely possible, unlike a real CAN_RAW socket.
    fn stream_pair() -> (SockCanRaw, SockCanRaw) {
        let mut fds = [0; 2];
        let status = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(status, 0);
        let left = unsafe { SockCanRaw::from_raw_fd(fds[0]) };
        let right = unsafe { SockCanRaw::from_raw_fd(fds[1]) };
        (left, right)
    }

    fn push_bytes(sock: &SockCanRaw, bytes: &[u8]) {
        let mut sent = 0;
        while sent < bytes.len() {
            let count = unsafe {
                libc::write(
                    sock.as_rawfd(),
                    bytes[sent..].as_ptr() as *const libc::c_void,
                    bytes.len() - sent,
                )
            };
            assert!(count > 0);
            sent += count as usize;
        }
    }

    #[test]
    fn recv_reassembles_partial_reads() {
        let (tx, rx) = stream_pair();
        let frame = CanFrame::new(CanId::new_std(0x123), &[1, 2, 3, 4, 5]).unwrap();
        let wire = frame.to_wire();

        let reader = thread::spawn(move || rx.recv());
        for chunk in [&wire[0..3], &wire[3..8], &wire[8..16]] {
            push_bytes(&tx, chunk);
            thread::sleep(Duration::from_millis(5));
        }

        match reader.join().unwrap().unwrap() {
            CanRecv::Frame(got) => assert_eq!(got, frame),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn nonblocking_empty_socket_yields_nodata() {
        let (_tx, mut rx) = stream_pair();
        rx.set_blocking(false).unwrap();
        assert_eq!(rx.recv().unwrap(), CanRecv::NoData);
    }

    #[test]
    fn blocking_toggle_round_trip() {
        let (mut tx, _rx) = stream_pair();
        assert!(tx.is_blocking().unwrap());
        tx.set_blocking(false).unwrap();
        assert!(!tx.is_blocking().unwrap());
        tx.set_blocking(true).unwrap();
        assert!(tx.is_blocking().unwrap());
    }

    #[test]
    fn send_emits_exact_wire_image() {
        let (tx, rx) = stream_pair();
        tx.send(&CanId::new_std(0x100), &[0xAA, 0xBB]).unwrap();

        let mut buffer = [0u8; 32];
        let count = unsafe {
            libc::read(rx.as_rawfd(), buffer.as_mut_ptr() as *mut libc::c_void, buffer.len())
        };
        assert_eq!(count, CAN_MTU as isize);

        let expected = CanFrame::new(CanId::new_std(0x100), &[0xAA, 0xBB]).unwrap().to_wire();
        assert_eq!(&buffer[..CAN_MTU], &expected);
    }

    #[test]
    fn invalid_id_rejected_before_any_write() {
        let (tx, mut rx) = stream_pair();
        rx.set_blocking(false).unwrap();

        match tx.send(&CanId::new_std(0x800), &[0]) {
            Err(CanError::InvalidArgument(_)) => {}
            other => panic!("expected invalid-argument, got {other:?}"),
        }
        assert_eq!(rx.recv().unwrap(), CanRecv::NoData);
    }

    #[test]
    fn oversize_payload_rejected_before_any_write() {
        let (tx, mut rx) = stream_pair();
        rx.set_blocking(false).unwrap();

        let payload = [0u8; 9];
        match tx.send(&CanId::new_std(0x42), &payload) {
            Err(CanError::InvalidArgument(_)) => {}
            other => panic!("expected invalid-argument, got {other:?}"),
        }
        assert_eq!(rx.recv().unwrap(), CanRecv::NoData);
    }

    #[test]
    fn error_frame_surfaces_as_invalid_with_id() {
        let (tx, rx) = stream_pair();

        let mut wire = [0u8; CAN_MTU];
        wire[..4].copy_from_slice(&(0x123 | CAN_ERR_FLAG).to_ne_bytes());
        wire[4] = 8;
        push_bytes(&tx, &wire);

        match rx.recv().unwrap() {
            CanRecv::Invalid(canid) => {
                assert!(canid.is_error());
                assert_eq!(canid.get_value(), 0x123);
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn recv_into_refuses_short_sink() {
        let (_tx, rx) = stream_pair();
        let mut sink = [0u8; 4];
        match rx.recv_into(&mut sink) {
            Err(CanError::InvalidArgument(_)) => {}
            other => panic!("expected invalid-argument, got {other:?}"),
        }
    }

    #[test]
    fn recv_into_copies_declared_length_only() {
        let (tx, rx) = stream_pair();
        tx.send(&CanId::new_std(0x77), &[9, 8, 7]).unwrap();

        let mut sink = [0xFFu8; 12];
        match rx.recv_into(&mut sink).unwrap() {
            CanRecv::Frame(frame) => {
                assert_eq!(frame.get_len(), 3);
                assert_eq!(frame.get_id(), CanId::new_std(0x77));
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(&sink[..3], &[9, 8, 7]);
        assert_eq!(&sink[3..], &[0xFF; 9]);
    }

    #[test]
    fn install_filter_refuses_invalid_id() {
        let (tx, _rx) = stream_pair();
        match tx.install_filter(&CanId::new_std(0x800)) {
            Err(CanError::InvalidArgument(_)) => {}
            other => panic!("expected invalid-argument, got {other:?}"),
        }
    }

    #[test]
    fn recipient_rule_matches_value_and_flags() {
        let mut filter = SockCanFilter::new(1);
        filter.match_recipient(&CanId::new_std(0x123));

        assert_eq!(filter.masks.len(), 1);
        assert_eq!(filter.masks[0].can_id, 0x123);
        assert_eq!(filter.masks[0].can_mask, 0xC000_0123);
        assert_eq!(filter.masks[0].can_mask, 0x123 | CAN_EFF_FLAG | CAN_RTR_FLAG);
    }

    #[test]
    fn whitelist_and_blacklist_rules() {
        let mut filter = SockCanFilter::new(2);
        filter
            .add_whitelist(0x257, FilterMask::SFF_MASK)
            .add_blacklist(0x118, FilterMask::SFF_MASK | FilterMask::ERR_FLAG);

        assert_eq!(
            filter.masks[0],
            FilterRule { can_id: 0x257, can_mask: CAN_SFF_MASK }
        );
        assert_eq!(
            filter.masks[1],
            FilterRule {
                can_id: 0x118 | CAN_INV_FILTER,
                can_mask: CAN_SFF_MASK | CAN_ERR_FLAG,
            }
        );
    }

    #[test]
    fn drop_releases_descriptor() {
        let (tx, _rx) = stream_pair();
        let fd = tx.as_rawfd();
        drop(tx);
        let status = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(status, -1);
    }

    #[test]
    fn open_unknown_interface_fails() {
        assert!(SockCanRaw::open("no-such-candev").is_err());
    }
}
