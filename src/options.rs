//! Socket option marshalling.
//!
//! A [`SocketOption`] ties a name and a value type to the pair of handlers
//! that move the value across the native boundary. Every option offers two
//! call paths: the validated one checks the value locally and fails with a
//! [`ValidationError`] before any syscall is made, the unchecked one passes
//! the value straight through and surfaces whatever the kernel reports.

use std::num::TryFromIntError;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use bitflags::bitflags;
use libc::{c_int, canid_t};

use crate::error::{Error, ValidationError};
use crate::frame::{padded_data_length, FdFlags, MAX_DATA_LENGTH};
use crate::{
    CAN_ISOTP_LL_OPTS, CAN_ISOTP_OPTS, CAN_ISOTP_RECV_FC, CAN_ISOTP_RX_STMIN,
    CAN_ISOTP_TX_STMIN, SOL_CAN_ISOTP,
};
use crate::sys;

/// The kernel accepts at most this many filters per raw socket.
pub const MAX_FILTERS: usize = 512;

bitflags! {
    /// Behaviour flags of an ISO-TP socket, `can_isotp_options.flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IsoTpBehaviour: u32 {
        /// listen only (do not send FC)
        const CAN_ISOTP_LISTEN_MODE = 0x001;
        /// enable extended addressing
        const CAN_ISOTP_EXTEND_ADDR = 0x002;
        /// enable CAN frame padding tx path
        const CAN_ISOTP_TX_PADDING = 0x004;
        /// enable CAN frame padding rx path
        const CAN_ISOTP_RX_PADDING = 0x008;
        /// check received CAN frame padding
        const CAN_ISOTP_CHK_PAD_LEN = 0x010;
        /// check received CAN frame padding
        const CAN_ISOTP_CHK_PAD_DATA = 0x020;
        /// half duplex error state handling
        const CAN_ISOTP_HALF_DUPLEX = 0x040;
        /// ignore stmin from received FC
        const CAN_ISOTP_FORCE_TXSTMIN = 0x080;
        /// ignore CFs depending on rx stmin
        const CAN_ISOTP_FORCE_RXSTMIN = 0x100;
        /// different rx extended addressing
        const CAN_ISOTP_RX_EXT_ADDR = 0x200;
    }
}

/// ISO-TP options aka `can_isotp_options`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IsoTpOptions {
    /// set flags for isotp behaviour.
    flags: u32,
    /// frame transmission time (N_As/N_Ar)
    /// time in nano secs
    frame_txtime: u32,
    /// set address for extended addressing
    ext_address: u8,
    /// set content of padding byte (tx)
    txpad_content: u8,
    /// set content of padding byte (rx)
    rxpad_content: u8,
    /// set address for extended addressing
    rx_ext_address: u8,
}

impl IsoTpOptions {
    pub fn new(
        flags: IsoTpBehaviour,
        frame_txtime: Duration,
        ext_address: u8,
        txpad_content: u8,
        rxpad_content: u8,
        rx_ext_address: u8,
    ) -> Result<Self, TryFromIntError> {
        Ok(Self {
            flags: flags.bits(),
            frame_txtime: u32::try_from(frame_txtime.as_nanos())?,
            ext_address,
            txpad_content,
            rxpad_content,
            rx_ext_address,
        })
    }

    /// get flags for isotp behaviour.
    pub fn flags(&self) -> Option<IsoTpBehaviour> {
        IsoTpBehaviour::from_bits(self.flags)
    }

    /// get frame transmission time (N_As/N_Ar)
    pub fn frame_txtime(&self) -> Duration {
        Duration::from_nanos(self.frame_txtime.into())
    }

    /// get address for extended addressing
    pub fn ext_address(&self) -> u8 {
        self.ext_address
    }

    /// get content of padding byte (tx)
    pub fn txpad_content(&self) -> u8 {
        self.txpad_content
    }

    /// get content of padding byte (rx)
    pub fn rxpad_content(&self) -> u8 {
        self.rxpad_content
    }

    /// get address for extended addressing
    pub fn rx_ext_address(&self) -> u8 {
        self.rx_ext_address
    }

    pub fn with_flags(self, flags: IsoTpBehaviour) -> Self {
        Self {
            flags: flags.bits(),
            ..self
        }
    }

    pub fn with_frame_txtime(self, frame_txtime: Duration) -> Result<Self, TryFromIntError> {
        Ok(Self {
            frame_txtime: u32::try_from(frame_txtime.as_nanos())?,
            ..self
        })
    }

    pub fn with_ext_address(self, ext_address: u8) -> Self {
        Self {
            ext_address,
            ..self
        }
    }

    pub fn with_txpad_content(self, txpad_content: u8) -> Self {
        Self {
            txpad_content,
            ..self
        }
    }

    pub fn with_rxpad_content(self, rxpad_content: u8) -> Self {
        Self {
            rxpad_content,
            ..self
        }
    }

    pub fn with_rx_ext_address(self, rx_ext_address: u8) -> Self {
        Self {
            rx_ext_address,
            ..self
        }
    }
}

impl Default for IsoTpOptions {
    fn default() -> Self {
        // Defaults defined in linux/can/isotp.h
        Self {
            flags: 0x00,
            frame_txtime: 0x00,
            ext_address: 0x00,
            txpad_content: 0xCC,
            rxpad_content: 0xCC,
            rx_ext_address: 0x00,
        }
    }
}

/// Flow control options aka `can_isotp_fc_options`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FlowControlOptions {
    /// blocksize provided in FC frame
    /// 0 = off
    bs: u8,
    /// separation time provided in FC frame
    ///
    /// 0x00 - 0x7F : 0 - 127 ms
    /// 0x80 - 0xF0 : reserved
    /// 0xF1 - 0xF9 : 100 us - 900 us
    /// 0xFA - 0xFF : reserved
    stmin: u8,
    /// max. number of wait frame transmiss.
    /// 0 = omit FC N_PDU WT
    wftmax: u8,
}

impl FlowControlOptions {
    pub fn new(bs: u8, stmin: u8, wftmax: u8) -> Self {
        Self { bs, stmin, wftmax }
    }

    pub fn block_size(&self) -> u8 {
        self.bs
    }

    pub fn minimum_separation_time(&self) -> u8 {
        self.stmin
    }

    pub fn maximum_wait_frames(&self) -> u8 {
        self.wftmax
    }

    pub fn with_block_size(self, bs: u8) -> Self {
        Self { bs, ..self }
    }

    pub fn with_minimum_separation_time(self, stmin: u8) -> Self {
        Self { stmin, ..self }
    }

    pub fn with_maximum_wait_frames(self, wftmax: u8) -> Self {
        Self { wftmax, ..self }
    }
}

impl Default for FlowControlOptions {
    fn default() -> Self {
        Self {
            // CAN_ISOTP_DEFAULT_RECV_BS
            bs: 0,
            // CAN_ISOTP_DEFAULT_RECV_STMIN
            stmin: 0x00,
            // CAN_ISOTP_DEFAULT_RECV_WFTMAX
            wftmax: 0,
        }
    }
}

/// Link layer options aka `can_isotp_ll_options`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct LinkLayerOptions {
    /// generated & accepted CAN frame type
    /// CAN_MTU   (16) -> standard CAN 2.0
    /// CANFD_MTU (72) -> CAN FD frame
    mtu: u8,
    /// tx link layer data length in bytes
    /// (configured maximum payload length)
    /// __u8 value : 8,12,16,20,24,32,48,64
    /// => rx path supports all LL_DL values
    tx_dl: u8,
    /// set into struct canfd_frame.flags
    /// at frame creation: e.g. CANFD_BRS
    tx_flags: u8,
}

impl LinkLayerOptions {
    pub fn new(mtu: u8, tx_dl: u8, tx_flags: FdFlags) -> Self {
        Self {
            mtu,
            tx_dl,
            tx_flags: tx_flags.bits(),
        }
    }

    pub fn mtu(&self) -> u8 {
        self.mtu
    }

    pub fn tx_data_length(&self) -> u8 {
        self.tx_dl
    }

    pub fn tx_flags(&self) -> FdFlags {
        FdFlags::from_bits_truncate(self.tx_flags)
    }

    pub fn with_mtu(self, mtu: u8) -> Self {
        Self { mtu, ..self }
    }

    pub fn with_tx_data_length(self, tx_dl: u8) -> Self {
        Self { tx_dl, ..self }
    }

    pub fn with_tx_flags(self, tx_flags: FdFlags) -> Self {
        Self {
            tx_flags: tx_flags.bits(),
            ..self
        }
    }

    /// The checks the kernel applies on bind, mirrored locally.
    ///
    /// See net/can/isotp.c: the MTU must name one of the two frame slot
    /// sizes, the transmission data length must be a padded value, and FD
    /// data lengths or flags require the FD MTU.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tx_dl != padded_data_length(self.tx_dl) {
            return Err(ValidationError::UnpaddedDataLength { tx_dl: self.tx_dl });
        }
        if self.mtu as usize != crate::frame::MTU && self.mtu as usize != crate::frame::FD_MTU {
            return Err(ValidationError::InvalidLinkLayerMtu { mtu: self.mtu });
        }
        if self.mtu as usize == crate::frame::MTU {
            if self.tx_dl as usize > MAX_DATA_LENGTH {
                return Err(ValidationError::DataLengthRequiresFd { tx_dl: self.tx_dl });
            }
            if self.tx_flags != 0 {
                return Err(ValidationError::FlagsRequireFd);
            }
        }
        Ok(())
    }
}

impl Default for LinkLayerOptions {
    fn default() -> Self {
        Self {
            // CAN_ISOTP_DEFAULT_LL_MTU
            mtu: crate::frame::MTU as u8,
            // CAN_ISOTP_DEFAULT_LL_TX_DL
            tx_dl: MAX_DATA_LENGTH as u8,
            // CAN_ISOTP_DEFAULT_LL_TX_FLAGS
            tx_flags: 0x00,
        }
    }
}

/// A single id/mask filter of a raw CAN socket, `struct can_filter`.
///
/// A frame matches when `frame.can_id & mask == id & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CanFilter {
    id: canid_t,
    mask: canid_t,
}

impl CanFilter {
    pub fn new(id: u32, mask: u32) -> Self {
        Self { id, mask }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }
}

/// A named, typed socket option and its marshalling handlers.
pub struct SocketOption<T> {
    name: &'static str,
    set: fn(RawFd, &T, bool) -> Result<(), Error>,
    get: fn(RawFd) -> Result<T, Error>,
}

impl<T> SocketOption<T> {
    const fn new(
        name: &'static str,
        set: fn(RawFd, &T, bool) -> Result<(), Error>,
        get: fn(RawFd) -> Result<T, Error>,
    ) -> Self {
        Self { name, set, get }
    }

    /// The option's name, e.g. `"LL_OPTS"`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn apply(&self, fd: RawFd, value: &T, validate: bool) -> Result<(), Error> {
        (self.set)(fd, value, validate)
    }

    pub(crate) fn read(&self, fd: RawFd) -> Result<T, Error> {
        (self.get)(fd)
    }
}

/// Option access for channels backed by a CAN socket.
pub trait ChannelOptions: AsRawFd {
    /// Sets an option after validating the value locally.
    fn set_option<T>(&self, option: &SocketOption<T>, value: &T) -> Result<(), Error> {
        option.apply(self.as_raw_fd(), value, true)
    }

    /// Sets an option without local validation; rejection, if any, comes
    /// from the kernel as a native error.
    fn set_option_unchecked<T>(&self, option: &SocketOption<T>, value: &T) -> Result<(), Error> {
        option.apply(self.as_raw_fd(), value, false)
    }

    /// Reads an option back from the kernel.
    fn get_option<T>(&self, option: &SocketOption<T>) -> Result<T, Error> {
        option.read(self.as_raw_fd())
    }
}

/// Option to configure general options using an [`IsoTpOptions`] value.
pub static OPTS: SocketOption<IsoTpOptions> = SocketOption::new(
    "OPTS",
    |fd, value, _validate| {
        sys::setsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_OPTS, value).map_err(Error::from)
    },
    |fd| sys::getsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_OPTS).map_err(Error::from),
);

/// Option to configure flow control using a [`FlowControlOptions`] value.
pub static RECV_FC: SocketOption<FlowControlOptions> = SocketOption::new(
    "RECV_FC",
    |fd, value, _validate| {
        sys::setsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_RECV_FC, value).map_err(Error::from)
    },
    |fd| sys::getsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_RECV_FC).map_err(Error::from),
);

/// Option to force the minimum transmission separation time, in nano secs.
pub static TX_STMIN: SocketOption<u32> = SocketOption::new(
    "TX_STMIN",
    |fd, value, _validate| {
        sys::setsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_TX_STMIN, value).map_err(Error::from)
    },
    |fd| sys::getsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_TX_STMIN).map_err(Error::from),
);

/// Option to configure the minimum receive separation time, in nano secs.
pub static RX_STMIN: SocketOption<u32> = SocketOption::new(
    "RX_STMIN",
    |fd, value, _validate| {
        sys::setsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_RX_STMIN, value).map_err(Error::from)
    },
    |fd| sys::getsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_RX_STMIN).map_err(Error::from),
);

/// Option to configure link layer options using a [`LinkLayerOptions`] value.
pub static LL_OPTS: SocketOption<LinkLayerOptions> = SocketOption::new(
    "LL_OPTS",
    |fd, value, validate| {
        if validate {
            value.validate()?;
        }
        sys::setsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_LL_OPTS, value).map_err(Error::from)
    },
    |fd| sys::getsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_LL_OPTS).map_err(Error::from),
);

/// Option to configure the filters of a raw socket.
pub static FILTER: SocketOption<Vec<CanFilter>> = SocketOption::new(
    "FILTER",
    |fd, value, validate| {
        if validate && value.len() > MAX_FILTERS {
            return Err(ValidationError::TooManyFilters {
                count: value.len(),
                max: MAX_FILTERS,
            }
            .into());
        }
        sys::setsockopt_slice(fd, libc::SOL_CAN_RAW, libc::CAN_RAW_FILTER, value)
            .map_err(Error::from)
    },
    |fd| {
        let mut filters = vec![CanFilter::new(0, 0); MAX_FILTERS];
        let count = sys::getsockopt_slice(
            fd,
            libc::SOL_CAN_RAW,
            libc::CAN_RAW_FILTER,
            &mut filters,
        )?;
        filters.truncate(count);
        Ok(filters)
    },
);

/// Option to configure the error frame filter of a raw socket.
pub static ERR_FILTER: SocketOption<u32> = SocketOption::new(
    "ERR_FILTER",
    |fd, value, _validate| {
        sys::setsockopt(fd, libc::SOL_CAN_RAW, libc::CAN_RAW_ERR_FILTER, value)
            .map_err(Error::from)
    },
    |fd| sys::getsockopt(fd, libc::SOL_CAN_RAW, libc::CAN_RAW_ERR_FILTER).map_err(Error::from),
);

fn set_raw_flag(fd: RawFd, name: c_int, value: &bool) -> Result<(), Error> {
    let value: c_int = (*value).into();
    sys::setsockopt(fd, libc::SOL_CAN_RAW, name, &value).map_err(Error::from)
}

fn get_raw_flag(fd: RawFd, name: c_int) -> Result<bool, Error> {
    let value: c_int = sys::getsockopt(fd, libc::SOL_CAN_RAW, name)?;
    Ok(value != 0)
}

/// Option to configure whether to loop back frames.
pub static LOOPBACK: SocketOption<bool> = SocketOption::new(
    "LOOPBACK",
    |fd, value, _validate| set_raw_flag(fd, libc::CAN_RAW_LOOPBACK, value),
    |fd| get_raw_flag(fd, libc::CAN_RAW_LOOPBACK),
);

/// Option to configure whether to receive outgoing frames back.
pub static RECV_OWN_MSGS: SocketOption<bool> = SocketOption::new(
    "RECV_OWN_MSGS",
    |fd, value, _validate| set_raw_flag(fd, libc::CAN_RAW_RECV_OWN_MSGS, value),
    |fd| get_raw_flag(fd, libc::CAN_RAW_RECV_OWN_MSGS),
);

/// Option to configure whether the socket accepts FD frames.
pub static FD_FRAMES: SocketOption<bool> = SocketOption::new(
    "FD_FRAMES",
    |fd, value, _validate| set_raw_flag(fd, libc::CAN_RAW_FD_FRAMES, value),
    |fd| get_raw_flag(fd, libc::CAN_RAW_FD_FRAMES),
);

/// Option to configure whether to join filters.
pub static JOIN_FILTERS: SocketOption<bool> = SocketOption::new(
    "JOIN_FILTERS",
    |fd, value, _validate| set_raw_flag(fd, libc::CAN_RAW_JOIN_FILTERS, value),
    |fd| get_raw_flag(fd, libc::CAN_RAW_JOIN_FILTERS),
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes_match_the_kernel_headers() {
        assert_eq!(size_of::<IsoTpOptions>(), 12);
        assert_eq!(size_of::<FlowControlOptions>(), 3);
        assert_eq!(size_of::<LinkLayerOptions>(), 3);
    }

    #[test]
    fn link_layer_defaults_are_classic() {
        let options = LinkLayerOptions::default();
        assert_eq!(options.mtu() as usize, crate::frame::MTU);
        assert_eq!(options.tx_data_length() as usize, MAX_DATA_LENGTH);
        assert_eq!(options.tx_flags(), FdFlags::empty());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn link_layer_mtu_must_be_a_frame_size() {
        let options = LinkLayerOptions::default().with_mtu(32);
        assert_eq!(
            options.validate(),
            Err(ValidationError::InvalidLinkLayerMtu { mtu: 32 })
        );

        let fd = LinkLayerOptions::new(crate::frame::FD_MTU as u8, 64, FdFlags::empty());
        assert!(fd.validate().is_ok());
    }

    #[test]
    fn link_layer_tx_dl_must_be_padded() {
        let options = LinkLayerOptions::new(crate::frame::FD_MTU as u8, 13, FdFlags::empty());
        assert_eq!(
            options.validate(),
            Err(ValidationError::UnpaddedDataLength { tx_dl: 13 })
        );
    }

    #[test]
    fn fd_settings_require_fd_mtu() {
        let long = LinkLayerOptions::new(crate::frame::MTU as u8, 16, FdFlags::empty());
        assert_eq!(
            long.validate(),
            Err(ValidationError::DataLengthRequiresFd { tx_dl: 16 })
        );

        let flagged =
            LinkLayerOptions::new(crate::frame::MTU as u8, 8, FdFlags::BIT_RATE_SWITCH);
        assert_eq!(flagged.validate(), Err(ValidationError::FlagsRequireFd));
    }

    #[test]
    fn validated_path_rejects_before_the_syscall() {
        // even a dead fd never gets touched when validation fails first
        let bad = LinkLayerOptions::default().with_mtu(32);
        match (LL_OPTS.set)(-1, &bad, true) {
            Err(Error::Validation(ValidationError::InvalidLinkLayerMtu { mtu: 32 })) => {}
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn unchecked_path_surfaces_the_native_rejection() {
        let bad = LinkLayerOptions::default().with_mtu(32);
        match (LL_OPTS.set)(-1, &bad, false) {
            Err(Error::Native(err)) => assert_eq!(err.errno(), Some(libc::EBADF)),
            other => panic!("expected a native error, got {other:?}"),
        }
    }

    #[test]
    fn filter_count_is_bounded_on_the_validated_path() {
        let too_many = vec![CanFilter::new(0x100, 0x7FF); MAX_FILTERS + 1];
        match (FILTER.set)(-1, &too_many, true) {
            Err(Error::Validation(ValidationError::TooManyFilters { count, max })) => {
                assert_eq!(count, MAX_FILTERS + 1);
                assert_eq!(max, MAX_FILTERS);
            }
            other => panic!("expected a validation error, got {other:?}"),
        }

        match (FILTER.set)(-1, &too_many, false) {
            Err(Error::Native(err)) => assert_eq!(err.errno(), Some(libc::EBADF)),
            other => panic!("expected a native error, got {other:?}"),
        }
    }

    #[test]
    fn isotp_defaults_use_cc_padding() {
        let options = IsoTpOptions::default();
        assert_eq!(options.txpad_content(), 0xCC);
        assert_eq!(options.rxpad_content(), 0xCC);
        assert_eq!(options.flags(), Some(IsoTpBehaviour::empty()));
    }

    #[test]
    fn with_mutators_copy_instead_of_mutating() {
        let base = IsoTpOptions::default();
        let derived = base
            .with_flags(IsoTpBehaviour::CAN_ISOTP_LISTEN_MODE)
            .with_ext_address(0x55);

        assert_eq!(base, IsoTpOptions::default());
        assert_eq!(
            derived.flags(),
            Some(IsoTpBehaviour::CAN_ISOTP_LISTEN_MODE)
        );
        assert_eq!(derived.ext_address(), 0x55);

        let fc = FlowControlOptions::default().with_block_size(4);
        assert_eq!(fc.block_size(), 4);
        assert_eq!(FlowControlOptions::default().block_size(), 0);
    }

    #[test]
    fn frame_txtime_overflow_is_rejected() {
        assert!(IsoTpOptions::default()
            .with_frame_txtime(Duration::from_secs(5))
            .is_err());
        assert!(IsoTpOptions::default()
            .with_frame_txtime(Duration::from_millis(100))
            .is_ok());
    }

    #[test]
    fn option_names() {
        assert_eq!(LL_OPTS.name(), "LL_OPTS");
        assert_eq!(FILTER.name(), "FILTER");
    }
}
