#![deny(clippy::all)]

//! Socketcan channels with epoll multiplexing.
//!
//! The Linux kernel supports using CAN-devices through a
//! [network-like API](https://www.kernel.org/doc/Documentation/networking/can.txt).
//! This crate allows easy access to this functionality without having to
//! wrestle libc calls: raw classic/FD frame sockets, the Broadcast Manager
//! protocol for scheduled transmission and change-filtered reception, and
//! ISO-TP sockets for data packets that exceed the eight bytes of a default
//! CAN frame ([can-isotp](https://github.com/hartkopp/can-isotp) is the
//! kernel module that takes care of the ISO-TP protocol itself).
//!
//! On top of the channels sits an [`EpollSelector`], a readiness
//! multiplexer for these non-standard socket families, and a
//! [`ChannelListener`] that dispatches received messages to per-channel
//! callbacks from a worker thread.
//!
//! ```rust,no_run
//! use socketcan_select::IsoTpSocket;
//!
//! fn main() -> Result<(), socketcan_select::Error> {
//!     let mut tp_socket = IsoTpSocket::open("vcan0", 0x321, 0x123)?;
//!
//!     loop {
//!         let buffer = tp_socket.read()?;
//!         println!("read {} bytes", buffer.len());
//!
//!         // print TP frame data
//!         for x in buffer {
//!             print!("{:X?} ", x);
//!         }
//!
//!         println!();
//!     }
//! }
//! ```

use libc::c_int;

pub mod bcm;
pub mod error;
pub mod frame;
pub mod listener;
pub mod options;
pub mod select;
pub mod socket;
mod sys;

/// ISO 15765-2 Transport Protocol
pub const CAN_ISOTP: c_int = libc::CAN_ISOTP;

/// undocumented isotp.h constant
pub const SOL_CAN_ISOTP: c_int = libc::SOL_CAN_BASE + libc::CAN_ISOTP;

/// pass struct `IsoTpOptions`
pub const CAN_ISOTP_OPTS: c_int = 1;

/// pass struct `FlowControlOptions`
pub const CAN_ISOTP_RECV_FC: c_int = 2;

/// pass __u32 value in nano secs
/// use this time instead of value
/// provided in FC from the receiver
pub const CAN_ISOTP_TX_STMIN: c_int = 3;

/// pass __u32 value in nano secs
/// ignore received CF frames which
/// timestamps differ less than val
pub const CAN_ISOTP_RX_STMIN: c_int = 4;

/// pass struct `LinkLayerOptions`
pub const CAN_ISOTP_LL_OPTS: c_int = 5;

pub use bcm::{BcmFlags, BcmMessage, BcmMessageBuilder, BcmOpcode};
pub use error::{Error, NativeError, ValidationError};
pub use frame::{
    padded_data_length, CanFrame, FdFlags, EFF_FLAG, EFF_MASK, ERR_FLAG, ERR_MASK,
    ERR_MASK_ALL, ERR_MASK_NONE, FD_MTU, MAX_DATA_LENGTH, MAX_FD_DATA_LENGTH, MTU, RTR_FLAG,
    SFF_MASK,
};
pub use listener::{ChannelListener, MessageHandler, PollChannel};
pub use options::{
    CanFilter, ChannelOptions, FlowControlOptions, IsoTpBehaviour, IsoTpOptions,
    LinkLayerOptions, SocketOption, MAX_FILTERS,
};
pub use select::{
    ChannelHandle, EpollSelector, Interest, IoEvent, NativeChannel, NativeHandle, Registration,
};
pub use socket::{BcmCanSocket, IsoTpSocket, RawCanSocket};

/// Listener specialization for ISO-TP channels.
pub type IsotpListener = ChannelListener<IsoTpSocket>;

/// Listener specialization for broadcast manager channels.
pub type BcmListener = ChannelListener<BcmCanSocket>;
