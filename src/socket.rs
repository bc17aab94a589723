//! The CAN channel types: raw frames, broadcast manager and ISO-TP.
//!
//! All three are thin owners of a socket descriptor. Reads and writes move
//! the wire structures of the [`frame`](crate::frame) and
//! [`bcm`](crate::bcm) codecs; options go through the
//! [`options`](crate::options) marshalling layer.

use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, sockaddr_can};

use crate::bcm::BcmMessage;
use crate::error::{Error, NativeError};
use crate::frame::{CanFrame, EFF_FLAG, SFF_MASK};
use crate::listener::PollChannel;
use crate::options::{
    ChannelOptions, FlowControlOptions, IsoTpOptions, LinkLayerOptions, OPTS, RECV_FC,
    LL_OPTS,
};
use crate::select::{ChannelHandle, NativeChannel, NativeHandle};
use crate::sys;

/// Size of buffer allocated for reading TP data
const RECV_BUFFER_SIZE: usize = 4096;

/// Ids above the standard range are transparently tagged as extended, the
/// way the kernel expects addresses to arrive.
fn address_id(id: u32) -> u32 {
    if id > SFF_MASK {
        id | EFF_FLAG
    } else {
        id
    }
}

fn can_address(if_index: c_int) -> sockaddr_can {
    let mut addr: sockaddr_can = unsafe { mem::zeroed() };
    addr.can_family = libc::AF_CAN as libc::sa_family_t;
    addr.can_ifindex = if_index;
    addr
}

fn isotp_address(if_index: c_int, rx_id: u32, tx_id: u32) -> sockaddr_can {
    let mut addr = can_address(if_index);
    addr.can_addr.tp.rx_id = address_id(rx_id);
    addr.can_addr.tp.tx_id = address_id(tx_id);
    addr
}

fn incomplete_write(written: usize, expected: usize) -> NativeError {
    NativeError {
        op: "write",
        source: std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("incomplete write: {written} of {expected} bytes"),
        ),
    }
}

/// An ISO-TP socketcan socket.
///
/// Reads and writes whole transport payloads; segmentation into CAN frames
/// and reassembly are the kernel's business. Will be closed upon
/// deallocation; internally this is just a wrapped socket descriptor.
///
/// Instructions for building and loading the `can-isotp` kernel module can
/// be found at [hartkopp/can-isotp](https://github.com/hartkopp/can-isotp).
pub struct IsoTpSocket {
    fd: RawFd,
    open: AtomicBool,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl IsoTpSocket {
    /// Opens a named CAN ISO-TP device such as "vcan0", receiving on
    /// `rx_id` and transmitting on `tx_id`, with default options.
    pub fn open(ifname: &str, rx_id: u32, tx_id: u32) -> Result<Self, Error> {
        Self::open_with_opts(
            ifname,
            rx_id,
            tx_id,
            Some(IsoTpOptions::default()),
            Some(FlowControlOptions::default()),
            Some(LinkLayerOptions::default()),
        )
    }

    /// Opens a named CAN ISO-TP device, passing additional options.
    pub fn open_with_opts(
        ifname: &str,
        rx_id: u32,
        tx_id: u32,
        isotp_options: Option<IsoTpOptions>,
        rx_flow_control_options: Option<FlowControlOptions>,
        link_layer_options: Option<LinkLayerOptions>,
    ) -> Result<Self, Error> {
        let if_index = sys::if_index(ifname)?;
        Self::open_if_with_opts(
            if_index,
            rx_id,
            tx_id,
            isotp_options,
            rx_flow_control_options,
            link_layer_options,
        )
    }

    /// Opens a CAN ISO-TP device by kernel interface number.
    pub fn open_if(if_index: c_int, rx_id: u32, tx_id: u32) -> Result<Self, Error> {
        Self::open_if_with_opts(
            if_index,
            rx_id,
            tx_id,
            Some(IsoTpOptions::default()),
            Some(FlowControlOptions::default()),
            Some(LinkLayerOptions::default()),
        )
    }

    /// Opens a CAN ISO-TP device by kernel interface number, passing
    /// additional options.
    pub fn open_if_with_opts(
        if_index: c_int,
        rx_id: u32,
        tx_id: u32,
        isotp_options: Option<IsoTpOptions>,
        rx_flow_control_options: Option<FlowControlOptions>,
        link_layer_options: Option<LinkLayerOptions>,
    ) -> Result<Self, Error> {
        let fd = sys::socket(libc::CAN_ISOTP)?;

        let configure = || -> Result<(), Error> {
            if let Some(isotp_options) = isotp_options {
                OPTS.apply(fd, &isotp_options, true)?;
            }
            if let Some(rx_flow_control_options) = rx_flow_control_options {
                RECV_FC.apply(fd, &rx_flow_control_options, true)?;
            }
            if let Some(link_layer_options) = link_layer_options {
                LL_OPTS.apply(fd, &link_layer_options, true)?;
            }
            sys::bind(fd, &isotp_address(if_index, rx_id, tx_id))?;
            Ok(())
        };

        // do not leak the descriptor when configuration fails
        if let Err(err) = configure() {
            let _ = sys::close(fd);
            return Err(err);
        }

        Ok(Self {
            fd,
            open: AtomicBool::new(true),
            recv_buffer: [0x00; RECV_BUFFER_SIZE],
        })
    }

    /// Change socket to non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError> {
        sys::set_nonblocking(self.fd, nonblocking)
    }

    /// Reads one transport payload into the internal buffer.
    pub fn read(&mut self) -> Result<&[u8], NativeError> {
        let n = sys::read(self.fd, &mut self.recv_buffer)?;
        Ok(&self.recv_buffer[..n])
    }

    /// Reads one transport payload into a caller-supplied buffer.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, NativeError> {
        sys::read(self.fd, buf)
    }

    /// Writes a transport payload.
    pub fn write(&self, buffer: &[u8]) -> Result<(), NativeError> {
        let written = sys::write(self.fd, buffer)?;
        if written != buffer.len() {
            return Err(incomplete_write(written, buffer.len()));
        }
        Ok(())
    }

    /// Closes the socket. Later operations fail with a native error.
    pub fn close(&self) -> Result<(), NativeError> {
        if self.open.swap(false, Ordering::SeqCst) {
            sys::close(self.fd)?;
        }
        Ok(())
    }
}

impl AsRawFd for IsoTpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for IsoTpSocket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd,
            open: AtomicBool::new(true),
            recv_buffer: [0x00; RECV_BUFFER_SIZE],
        }
    }
}

impl IntoRawFd for IsoTpSocket {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for IsoTpSocket {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("couldn't close ISO-TP socket: {err}");
        }
    }
}

impl NativeChannel for IsoTpSocket {
    fn handle(&self) -> ChannelHandle {
        ChannelHandle::Fd(NativeHandle::new(self.fd))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl PollChannel for IsoTpSocket {
    fn recv(&self, buf: &mut [u8]) -> Result<usize, NativeError> {
        IsoTpSocket::recv(self, buf)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError> {
        IsoTpSocket::set_nonblocking(self, nonblocking)
    }
}

impl ChannelOptions for IsoTpSocket {}

/// A raw CAN socket carrying single classic or FD frames.
pub struct RawCanSocket {
    fd: RawFd,
    open: AtomicBool,
}

impl RawCanSocket {
    /// Opens a named raw CAN device such as "vcan0".
    pub fn open(ifname: &str) -> Result<Self, Error> {
        let if_index = sys::if_index(ifname)?;
        Self::open_if(if_index)
    }

    /// Opens a raw CAN device by kernel interface number.
    pub fn open_if(if_index: c_int) -> Result<Self, Error> {
        let fd = sys::socket_raw()?;
        if let Err(err) = sys::bind(fd, &can_address(if_index)) {
            let _ = sys::close(fd);
            return Err(err.into());
        }
        Ok(Self {
            fd,
            open: AtomicBool::new(true),
        })
    }

    /// Change socket to non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError> {
        sys::set_nonblocking(self.fd, nonblocking)
    }

    /// Sends one frame.
    pub fn send(&self, frame: &CanFrame<'_>) -> Result<(), NativeError> {
        let bytes = frame.as_bytes();
        let written = sys::write(self.fd, bytes)?;
        if written != bytes.len() {
            return Err(incomplete_write(written, bytes.len()));
        }
        Ok(())
    }

    /// Receives one frame as a view into `buf`.
    ///
    /// The buffer should hold [`FD_MTU`](crate::frame::FD_MTU) bytes when the
    /// socket negotiated FD frames; the size the kernel hands back decides
    /// whether the view is a classic or an FD frame.
    pub fn receive<'a>(&self, buf: &'a mut [u8]) -> Result<CanFrame<'a>, Error> {
        let n = sys::read(self.fd, buf)?;
        CanFrame::parse(&buf[..n]).map_err(Error::from)
    }

    /// Closes the socket. Later operations fail with a native error.
    pub fn close(&self) -> Result<(), NativeError> {
        if self.open.swap(false, Ordering::SeqCst) {
            sys::close(self.fd)?;
        }
        Ok(())
    }
}

impl AsRawFd for RawCanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for RawCanSocket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd,
            open: AtomicBool::new(true),
        }
    }
}

impl IntoRawFd for RawCanSocket {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for RawCanSocket {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("couldn't close raw CAN socket: {err}");
        }
    }
}

impl NativeChannel for RawCanSocket {
    fn handle(&self) -> ChannelHandle {
        ChannelHandle::Fd(NativeHandle::new(self.fd))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl PollChannel for RawCanSocket {
    fn recv(&self, buf: &mut [u8]) -> Result<usize, NativeError> {
        sys::read(self.fd, buf)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError> {
        RawCanSocket::set_nonblocking(self, nonblocking)
    }
}

impl ChannelOptions for RawCanSocket {}

/// A broadcast manager socket for scheduled transmission and
/// change-filtered reception.
///
/// BCM sockets are connected, not bound; every [`BcmMessage`] written
/// instructs the broadcast manager, and notifications come back as messages
/// of the same shape.
pub struct BcmCanSocket {
    fd: RawFd,
    open: AtomicBool,
}

impl BcmCanSocket {
    /// Opens a named CAN device such as "vcan0" against the broadcast
    /// manager.
    pub fn open(ifname: &str) -> Result<Self, Error> {
        let if_index = sys::if_index(ifname)?;
        Self::open_if(if_index)
    }

    /// Opens a broadcast manager socket by kernel interface number.
    pub fn open_if(if_index: c_int) -> Result<Self, Error> {
        let fd = sys::socket(libc::CAN_BCM)?;
        if let Err(err) = sys::connect(fd, &can_address(if_index)) {
            let _ = sys::close(fd);
            return Err(err.into());
        }
        Ok(Self {
            fd,
            open: AtomicBool::new(true),
        })
    }

    /// Change socket to non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError> {
        sys::set_nonblocking(self.fd, nonblocking)
    }

    /// Sends one message to the broadcast manager.
    pub fn send(&self, message: &BcmMessage<'_>) -> Result<(), NativeError> {
        let bytes = message.as_bytes();
        let written = sys::write(self.fd, bytes)?;
        if written != bytes.len() {
            return Err(incomplete_write(written, bytes.len()));
        }
        Ok(())
    }

    /// Receives one notification as a view into `buf`.
    pub fn receive<'a>(&self, buf: &'a mut [u8]) -> Result<BcmMessage<'a>, Error> {
        let n = sys::read(self.fd, buf)?;
        BcmMessage::parse(&buf[..n]).map_err(Error::from)
    }

    /// Closes the socket. Later operations fail with a native error.
    pub fn close(&self) -> Result<(), NativeError> {
        if self.open.swap(false, Ordering::SeqCst) {
            sys::close(self.fd)?;
        }
        Ok(())
    }
}

impl AsRawFd for BcmCanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for BcmCanSocket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd,
            open: AtomicBool::new(true),
        }
    }
}

impl IntoRawFd for BcmCanSocket {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for BcmCanSocket {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("couldn't close BCM socket: {err}");
        }
    }
}

impl NativeChannel for BcmCanSocket {
    fn handle(&self) -> ChannelHandle {
        ChannelHandle::Fd(NativeHandle::new(self.fd))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl PollChannel for BcmCanSocket {
    fn recv(&self, buf: &mut [u8]) -> Result<usize, NativeError> {
        sys::read(self.fd, buf)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), NativeError> {
        BcmCanSocket::set_nonblocking(self, nonblocking)
    }
}

impl ChannelOptions for BcmCanSocket {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_ids_become_extended_addresses() {
        assert_eq!(address_id(0x7FF), 0x7FF);
        assert_eq!(address_id(0x800), 0x800 | EFF_FLAG);
        assert_eq!(address_id(0x18DB33F1), 0x18DB33F1 | EFF_FLAG);
    }

    #[test]
    fn isotp_addresses_carry_both_ids() {
        let addr = isotp_address(3, 0x7E8, 0x7E0);
        assert_eq!(addr.can_family, libc::AF_CAN as libc::sa_family_t);
        assert_eq!(addr.can_ifindex, 3);
        unsafe {
            assert_eq!(addr.can_addr.tp.rx_id, 0x7E8);
            assert_eq!(addr.can_addr.tp.tx_id, 0x7E0);
        }
    }

    #[test]
    fn unknown_interfaces_fail_the_lookup() {
        assert!(matches!(
            IsoTpSocket::open("no-such-interface-0", 0x7E8, 0x7E0),
            Err(Error::Lookup { .. })
        ));
        assert!(matches!(
            RawCanSocket::open("no-such-interface-0"),
            Err(Error::Lookup { .. })
        ));
        assert!(matches!(
            BcmCanSocket::open("no-such-interface-0"),
            Err(Error::Lookup { .. })
        ));
    }
}
