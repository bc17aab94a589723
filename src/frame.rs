//! Classic CAN and CAN FD frame codec.
//!
//! A [`CanFrame`] is a shallow, zero-copy view over a buffer of exactly
//! [`MTU`] or [`FD_MTU`] bytes laid out as the kernel's `can_frame` /
//! `canfd_frame` structs: a 32 bit id word carrying the EFF/RTR/ERR tag bits,
//! a length byte, a flags byte (FD frames only) and the payload padded to the
//! slot size. Owned frames and borrowed views share the same type; the
//! borrow checker keeps a view from outliving the buffer it was parsed from.

use std::borrow::Cow;
use std::fmt;

use bitflags::bitflags;
use embedded_can::{ExtendedId, Id, StandardId};

use crate::error::ValidationError;

pub use libc::{
    CAN_EFF_FLAG as EFF_FLAG, CAN_EFF_MASK as EFF_MASK, CAN_ERR_FLAG as ERR_FLAG,
    CAN_ERR_MASK as ERR_MASK, CAN_RTR_FLAG as RTR_FLAG, CAN_SFF_MASK as SFF_MASK,
};

/// Size of a classic CAN frame slot: `struct can_frame`.
pub const MTU: usize = libc::CAN_MTU;

/// Size of a CAN FD frame slot: `struct canfd_frame`.
pub const FD_MTU: usize = libc::CANFD_MTU;

/// Maximum payload of a classic frame according to ISO 11898-1.
pub const MAX_DATA_LENGTH: usize = libc::CAN_MAX_DLEN;

/// Maximum payload of an FD frame.
pub const MAX_FD_DATA_LENGTH: usize = libc::CANFD_MAX_DLEN;

/// an error mask that will cause Socketcan to report all errors
pub const ERR_MASK_ALL: u32 = ERR_MASK;

/// an error mask that will cause Socketcan to silently drop all errors
pub const ERR_MASK_NONE: u32 = 0;

const OFFSET_ID: usize = 0;
const OFFSET_LEN: usize = 4;
const OFFSET_FLAGS: usize = 5;
const OFFSET_DATA: usize = 8;

bitflags! {
    /// Per-frame flags of an FD frame, stored in the `canfd_frame.flags` byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FdFlags: u8 {
        /// bit rate switch (second bitrate for payload data)
        const BIT_RATE_SWITCH = libc::CANFD_BRS as u8;
        /// error state indicator of the transmitting node
        const ERROR_STATE_INDICATOR = libc::CANFD_ESI as u8;
    }
}

/// Pads a data length value as per the ISO 11898-1 DLC table.
///
/// This is the lookup the kernel's ISO-TP implementation applies to link
/// layer data lengths: 0 to 8 pad to 8, everything above rounds up to the
/// next of 12, 16, 20, 24, 32, 48 and 64. Inputs above 64 are not valid data
/// lengths and saturate at 64.
pub fn padded_data_length(length: u8) -> u8 {
    match length {
        0..=8 => 8,
        9..=12 => 12,
        13..=16 => 16,
        17..=20 => 20,
        21..=24 => 24,
        25..=32 => 32,
        33..=48 => 48,
        _ => 64,
    }
}

/// Rounds an FD payload length up to a representable DLC value.
///
/// Unlike [`padded_data_length`], lengths up to 8 stay as they are; those are
/// all representable on the wire.
fn fd_wire_length(length: usize) -> usize {
    if length <= MAX_DATA_LENGTH {
        length
    } else {
        padded_data_length(length as u8) as usize
    }
}

/// A single classic or FD CAN frame.
///
/// Constructed from its parts (allocating a correctly sized slot) or parsed
/// as a view over a caller-owned buffer. Frames are immutable once built.
#[derive(Clone)]
pub struct CanFrame<'a> {
    bytes: Cow<'a, [u8]>,
}

impl<'a> CanFrame<'a> {
    /// Creates a classic frame. `extended` selects 29 bit addressing.
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<CanFrame<'static>, ValidationError> {
        if data.len() > MAX_DATA_LENGTH {
            return Err(ValidationError::PayloadTooLong {
                length: data.len(),
                max: MAX_DATA_LENGTH,
            });
        }
        Ok(Self::build(
            prepare_id(id, extended)?,
            false,
            0,
            data,
            data.len(),
        ))
    }

    /// Creates an FD frame carrying up to 64 payload bytes.
    ///
    /// The materialized data length is rounded up to a representable DLC
    /// value, so a 9 byte payload comes back as 12 bytes with zero padding.
    pub fn new_fd(
        id: u32,
        extended: bool,
        flags: FdFlags,
        data: &[u8],
    ) -> Result<CanFrame<'static>, ValidationError> {
        if data.len() > MAX_FD_DATA_LENGTH {
            return Err(ValidationError::PayloadTooLong {
                length: data.len(),
                max: MAX_FD_DATA_LENGTH,
            });
        }
        Ok(Self::build(
            prepare_id(id, extended)?,
            true,
            flags.bits(),
            data,
            fd_wire_length(data.len()),
        ))
    }

    /// Creates a remote transmission request with the given data length code.
    pub fn new_remote(
        id: u32,
        extended: bool,
        dlc: usize,
    ) -> Result<CanFrame<'static>, ValidationError> {
        if dlc > MAX_DATA_LENGTH {
            return Err(ValidationError::PayloadTooLong {
                length: dlc,
                max: MAX_DATA_LENGTH,
            });
        }
        Ok(Self::build(
            prepare_id(id, extended)? | RTR_FLAG,
            false,
            0,
            &[],
            dlc,
        ))
    }

    fn build(
        id_word: u32,
        fd: bool,
        flags: u8,
        data: &[u8],
        wire_length: usize,
    ) -> CanFrame<'static> {
        let mut bytes = vec![0u8; if fd { FD_MTU } else { MTU }];
        bytes[OFFSET_ID..OFFSET_ID + 4].copy_from_slice(&id_word.to_ne_bytes());
        bytes[OFFSET_LEN] = wire_length as u8;
        if fd {
            bytes[OFFSET_FLAGS] = flags;
        }
        bytes[OFFSET_DATA..OFFSET_DATA + data.len()].copy_from_slice(data);
        CanFrame {
            bytes: Cow::Owned(bytes),
        }
    }

    /// Parses a frame from a buffer holding exactly one frame slot.
    ///
    /// The slot size decides the frame type: [`MTU`] bytes make a classic
    /// frame, [`FD_MTU`] bytes an FD one. The returned frame borrows `buf`.
    pub fn parse(buf: &'a [u8]) -> Result<Self, ValidationError> {
        if buf.len() < MTU {
            return Err(ValidationError::BufferTooSmall {
                required: MTU,
                available: buf.len(),
            });
        }
        if buf.len() != MTU && buf.len() != FD_MTU {
            return Err(ValidationError::InvalidFrameLength { length: buf.len() });
        }
        let frame = Self::view_unchecked(buf);
        let max = frame.max_data_length();
        let len = frame.len();
        // a valid slot size can still carry a conflicting length byte
        if len > max {
            return Err(ValidationError::DataLengthExceedsSlot { length: len, max });
        }
        Ok(frame)
    }

    /// Parses a frame at `offset` in a larger buffer. The caller supplies the
    /// addressing mode, which implies how many bytes the slot occupies.
    pub fn parse_at(buf: &'a [u8], offset: usize, fd: bool) -> Result<Self, ValidationError> {
        let mtu = if fd { FD_MTU } else { MTU };
        let required = offset.saturating_add(mtu);
        if buf.len() < required {
            return Err(ValidationError::BufferTooSmall {
                required,
                available: buf.len(),
            });
        }
        Self::parse(&buf[offset..required])
    }

    /// View over a slot whose size and length byte were already validated.
    pub(crate) fn view_unchecked(buf: &'a [u8]) -> Self {
        CanFrame {
            bytes: Cow::Borrowed(buf),
        }
    }

    /// Detaches the frame from its backing buffer.
    pub fn to_owned(&self) -> CanFrame<'static> {
        CanFrame {
            bytes: Cow::Owned(self.bytes.clone().into_owned()),
        }
    }

    /// The full 32 bit id word as the kernel sees it, EFF/RTR/ERR bits
    /// included.
    pub fn id_word(&self) -> u32 {
        u32::from_ne_bytes(self.bytes[OFFSET_ID..OFFSET_ID + 4].try_into().unwrap())
    }

    /// The bare CAN id, 11 or 29 bits from the LSB.
    pub fn raw_id(&self) -> u32 {
        let mask = if self.is_extended() { EFF_MASK } else { SFF_MASK };
        self.id_word() & mask
    }

    /// The data length as recorded in the slot.
    pub fn len(&self) -> usize {
        self.bytes[OFFSET_LEN] as usize
    }

    /// Whether the frame carries no payload bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The FD flags byte. Undefined for frames that are not FD frames.
    pub fn fd_flags(&self) -> FdFlags {
        FdFlags::from_bits_truncate(self.bytes[OFFSET_FLAGS])
    }

    /// The payload bytes, without slot padding.
    pub fn data(&self) -> &[u8] {
        &self.bytes[OFFSET_DATA..OFFSET_DATA + self.len()]
    }

    /// Whether this is an FD frame: it either carries FD flags or more
    /// payload than a classic frame can.
    pub fn is_fd(&self) -> bool {
        self.bytes[OFFSET_FLAGS] != 0 || self.len() > MAX_DATA_LENGTH
    }

    /// Whether the frame uses the extended (29 bit) format.
    pub fn is_extended(&self) -> bool {
        self.id_word() & EFF_FLAG != 0
    }

    /// Whether the frame is a remote transmission request.
    pub fn is_remote(&self) -> bool {
        self.id_word() & RTR_FLAG != 0
    }

    /// Whether the frame is an error frame.
    pub fn is_error_frame(&self) -> bool {
        self.id_word() & ERR_FLAG != 0
    }

    /// The error class bits. Undefined for frames that are not error frames.
    pub fn error_bits(&self) -> u32 {
        self.id_word() & ERR_MASK
    }

    fn max_data_length(&self) -> usize {
        if self.bytes.len() == FD_MTU {
            MAX_FD_DATA_LENGTH
        } else {
            MAX_DATA_LENGTH
        }
    }

    /// The size of the backing slot, [`MTU`] or [`FD_MTU`].
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The raw slot bytes, padding included, ready for a channel write.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn prepare_id(id: u32, extended: bool) -> Result<u32, ValidationError> {
    if extended {
        if id > EFF_MASK {
            return Err(ValidationError::ExtendedIdTooLarge { id });
        }
        Ok(id | EFF_FLAG)
    } else {
        if id > SFF_MASK {
            return Err(ValidationError::StandardIdTooLarge { id });
        }
        Ok(id)
    }
}

/// Logical equality: id word, payload and FD behaviour; slot padding beyond
/// the recorded data length is never compared.
impl PartialEq for CanFrame<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id_word() == other.id_word()
            && self.data() == other.data()
            && self.is_fd() == other.is_fd()
            && (!self.is_fd() || self.fd_flags() == other.fd_flags())
    }
}

impl Eq for CanFrame<'_> {}

impl fmt::Debug for CanFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fd() {
            write!(f, "CanFdFrame(")?;
        } else {
            write!(f, "CanFrame(")?;
        }
        write!(
            f,
            "ID={:02X}, FLAGS={:X}, LEN={}, DATA=[",
            self.raw_id(),
            self.fd_flags().bits(),
            self.len()
        )?;
        for (i, byte) in self.data().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        write!(f, "])")
    }
}

impl embedded_can::Frame for CanFrame<'_> {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let frame = match id.into() {
            Id::Standard(id) => CanFrame::new(id.as_raw() as u32, false, data),
            Id::Extended(id) => CanFrame::new(id.as_raw(), true, data),
        };
        frame.ok().map(|frame| CanFrame { bytes: frame.bytes })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        let frame = match id.into() {
            Id::Standard(id) => CanFrame::new_remote(id.as_raw() as u32, false, dlc),
            Id::Extended(id) => CanFrame::new_remote(id.as_raw(), true, dlc),
        };
        frame.ok().map(|frame| CanFrame { bytes: frame.bytes })
    }

    fn is_extended(&self) -> bool {
        CanFrame::is_extended(self)
    }

    fn is_remote_frame(&self) -> bool {
        self.is_remote()
    }

    fn id(&self) -> Id {
        if self.is_extended() {
            // the masked id always fits the constructor's range
            Id::Extended(ExtendedId::new(self.raw_id()).unwrap())
        } else {
            Id::Standard(StandardId::new(self.raw_id() as u16).unwrap())
        }
    }

    fn dlc(&self) -> usize {
        self.len()
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_classic() {
        let frame = CanFrame::new(0x123, false, &[0xDE, 0xAD, 0xBE]).unwrap();
        assert_eq!(frame.size(), MTU);

        let decoded = CanFrame::parse(frame.as_bytes()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.raw_id(), 0x123);
        assert!(!decoded.is_extended());
        assert!(!decoded.is_fd());
        assert_eq!(decoded.data(), &[0xDE, 0xAD, 0xBE]);
    }

    #[test]
    fn round_trip_extended_fd() {
        let data: Vec<u8> = (0u8..48).collect();
        let frame =
            CanFrame::new_fd(0x1ABCDE, true, FdFlags::BIT_RATE_SWITCH, &data).unwrap();
        assert_eq!(frame.size(), FD_MTU);

        let decoded = CanFrame::parse(frame.as_bytes()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.raw_id(), 0x1ABCDE);
        assert!(decoded.is_extended());
        assert!(decoded.is_fd());
        assert_eq!(decoded.fd_flags(), FdFlags::BIT_RATE_SWITCH);
        assert_eq!(decoded.data(), &data[..]);
    }

    #[test]
    fn fd_length_is_materialized_padded() {
        let frame = CanFrame::new_fd(0x10, false, FdFlags::empty(), &[0xAA; 9]).unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame.data()[..9], &[0xAA; 9]);
        assert_eq!(&frame.data()[9..], &[0x00; 3]);
    }

    #[test]
    fn id_range_is_validated() {
        assert!(matches!(
            CanFrame::new(0x800, false, &[]),
            Err(ValidationError::StandardIdTooLarge { id: 0x800 })
        ));
        assert!(matches!(
            CanFrame::new(0x2000_0000, true, &[]),
            Err(ValidationError::ExtendedIdTooLarge { .. })
        ));
        assert!(CanFrame::new(0x7FF, false, &[]).is_ok());
        assert!(CanFrame::new(0x1FFF_FFFF, true, &[]).is_ok());
    }

    #[test]
    fn payload_length_is_validated() {
        assert!(matches!(
            CanFrame::new(0x1, false, &[0u8; 9]),
            Err(ValidationError::PayloadTooLong { length: 9, max: 8 })
        ));
        assert!(matches!(
            CanFrame::new_fd(0x1, false, FdFlags::empty(), &[0u8; 65]),
            Err(ValidationError::PayloadTooLong { length: 65, max: 64 })
        ));
    }

    #[test]
    fn parse_rejects_bad_buffers() {
        assert!(matches!(
            CanFrame::parse(&[0u8; 8]),
            Err(ValidationError::BufferTooSmall { .. })
        ));
        assert!(matches!(
            CanFrame::parse(&[0u8; 32]),
            Err(ValidationError::InvalidFrameLength { length: 32 })
        ));

        // classic slot with an FD-sized length byte
        let mut slot = [0u8; MTU];
        slot[OFFSET_LEN] = 12;
        assert!(matches!(
            CanFrame::parse(&slot),
            Err(ValidationError::DataLengthExceedsSlot { length: 12, max: 8 })
        ));
    }

    #[test]
    fn parse_at_offset_is_zero_copy() {
        let frame = CanFrame::new(0x42, false, &[1, 2, 3, 4]).unwrap();
        let mut buf = vec![0xFFu8; 4 + MTU];
        buf[4..].copy_from_slice(frame.as_bytes());

        let view = CanFrame::parse_at(&buf, 4, false).unwrap();
        assert_eq!(view, frame);

        assert!(matches!(
            CanFrame::parse_at(&buf, 4, true),
            Err(ValidationError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn equality_ignores_slot_padding() {
        let classic = CanFrame::new(0x77, false, &[9, 9]).unwrap();

        // the same logical frame widened into an FD slot, trailing garbage
        let mut wide = vec![0u8; FD_MTU];
        wide[..MTU].copy_from_slice(classic.as_bytes());
        wide[FD_MTU - 1] = 0xEE;
        let widened = CanFrame::parse(&wide).unwrap();

        assert_eq!(widened, classic);
    }

    #[test]
    fn remote_frames_carry_dlc_without_payload() {
        let frame = CanFrame::new_remote(0x321, false, 4).unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.raw_id(), 0x321);
    }

    #[test]
    fn padding_law() {
        // fixed points from the kernel table
        assert_eq!(padded_data_length(5), 8);
        assert_eq!(padded_data_length(13), 16);
        assert_eq!(padded_data_length(48), 48);
        assert_eq!(padded_data_length(49), 64);

        let mut previous = 0;
        for n in 0..=64u8 {
            let padded = padded_data_length(n);
            // idempotent and monotonic non-decreasing
            assert_eq!(padded_data_length(padded), padded);
            assert!(padded >= previous);
            assert!(padded >= n);
            previous = padded;
        }
    }

    #[test]
    fn embedded_can_frame_integration() {
        use embedded_can::Frame as _;

        let id = StandardId::new(0x123).unwrap();
        let frame = <CanFrame as embedded_can::Frame>::new(id, &[1, 2, 3]).unwrap();
        assert_eq!(frame.id(), Id::Standard(id));
        assert_eq!(frame.dlc(), 3);
    }
}
