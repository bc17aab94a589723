//! Broadcast Manager message codec.
//!
//! A BCM message is the `struct bcm_msg_head` from `linux/can/bcm.h`
//! followed by `nframes` frame slots of one uniform size. The size of every
//! slot is decided by the [`BcmFlags::CAN_FD_FRAME`] flag: 72 bytes when it
//! is set, 16 otherwise. [`BcmMessage`] is a read-only view over such a
//! buffer; [`BcmMessageBuilder`] accumulates the parts and materializes the
//! buffer once, when all frames are known.
//!
//! See the [kernel CAN documentation](https://www.kernel.org/doc/html/latest/networking/can.html#broadcast-manager-protocol-sockets-sock-dgram)
//! for the protocol semantics behind the op-codes and flags.

use std::borrow::Cow;
use std::fmt;
use std::mem::{offset_of, size_of};
use std::time::Duration;

use bitflags::bitflags;
use libc::{canid_t, timeval};

use crate::error::{Error, ValidationError};
use crate::frame::{CanFrame, FD_MTU, MTU};

/// `struct bcm_msg_head`, used only for its compiler-computed layout.
#[allow(dead_code)]
#[repr(C)]
struct BcmMsgHead {
    opcode: u32,
    flags: u32,
    count: u32,
    ival1: timeval,
    ival2: timeval,
    can_id: canid_t,
    nframes: u32,
}

/// The platform dependent byte count of `struct bcm_msg_head`, frame slots
/// start at this offset.
pub const HEADER_LENGTH: usize = size_of::<BcmMsgHead>();

const OFFSET_OPCODE: usize = offset_of!(BcmMsgHead, opcode);
const OFFSET_FLAGS: usize = offset_of!(BcmMsgHead, flags);
const OFFSET_COUNT: usize = offset_of!(BcmMsgHead, count);
const OFFSET_IVAL1: usize = offset_of!(BcmMsgHead, ival1);
const OFFSET_IVAL2: usize = offset_of!(BcmMsgHead, ival2);
const OFFSET_CAN_ID: usize = offset_of!(BcmMsgHead, can_id);
const OFFSET_NFRAMES: usize = offset_of!(BcmMsgHead, nframes);

const OFFSET_TV_SEC: usize = offset_of!(timeval, tv_sec);
const OFFSET_TV_USEC: usize = offset_of!(timeval, tv_usec);

/// The operation for the broadcast manager to carry out, or the kind of
/// notification it sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BcmOpcode {
    /// Create (cyclic) transmission task.
    TxSetup = 1,
    /// Remove (cyclic) transmission task.
    TxDelete = 2,
    /// Read properties of (cyclic) transmission task.
    TxRead = 3,
    /// Send one CAN frame.
    TxSend = 4,
    /// Create RX content filter subscription.
    RxSetup = 5,
    /// Remove RX content filter subscription.
    RxDelete = 6,
    /// Read properties of RX content filter subscription.
    RxRead = 7,
    /// Reply to a TX_READ request.
    TxStatus = 8,
    /// Notification on performed transmissions (count reached zero).
    TxExpired = 9,
    /// Reply to an RX_READ request.
    RxStatus = 10,
    /// Cyclic message is absent.
    RxTimeout = 11,
    /// Updated CAN frame, a content change was detected.
    RxChanged = 12,
}

impl TryFrom<u32> for BcmOpcode {
    type Error = ValidationError;

    fn try_from(opcode: u32) -> Result<Self, ValidationError> {
        Ok(match opcode {
            1 => BcmOpcode::TxSetup,
            2 => BcmOpcode::TxDelete,
            3 => BcmOpcode::TxRead,
            4 => BcmOpcode::TxSend,
            5 => BcmOpcode::RxSetup,
            6 => BcmOpcode::RxDelete,
            7 => BcmOpcode::RxRead,
            8 => BcmOpcode::TxStatus,
            9 => BcmOpcode::TxExpired,
            10 => BcmOpcode::RxStatus,
            11 => BcmOpcode::RxTimeout,
            12 => BcmOpcode::RxChanged,
            opcode => return Err(ValidationError::UnknownOpcode { opcode }),
        })
    }
}

bitflags! {
    /// Broadcast Manager message flags from `linux/can/bcm.h`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BcmFlags: u32 {
        /// set the values of ival1, ival2 and count
        const SETTIMER = 0x0001;
        /// start the timer with the actual values of ival1, ival2 and count
        const STARTTIMER = 0x0002;
        /// create the message TX_EXPIRED when count expires
        const TX_COUNTEVT = 0x0004;
        /// a change of data by the process is emitted immediately
        const TX_ANNOUNCE = 0x0008;
        /// copy the can_id from the message header to each subsequent frame
        const TX_CP_CAN_ID = 0x0010;
        /// filter by can_id alone, no frames required (nframes=0)
        const RX_FILTER_ID = 0x0020;
        /// a change of the DLC leads to an RX_CHANGED
        const RX_CHECK_DLC = 0x0040;
        /// prevent automatically starting the timeout monitor
        const RX_NO_AUTOTIMER = 0x0080;
        /// generate an RX_CHANGED when the (cyclic) receive restarts after a
        /// receive timeout
        const RX_ANNOUNCE_RESUME = 0x0100;
        /// reset the index for the multiple frame transmission
        const TX_RESET_MULTI_IDX = 0x0200;
        /// send reply for RTR-request (placed in frame slot 0)
        const RX_RTR_FRAME = 0x0400;
        /// the subsequent frame slots use `struct canfd_frame`
        const CAN_FD_FRAME = 0x0800;
    }
}

fn slot_size(flags: BcmFlags) -> usize {
    if flags.contains(BcmFlags::CAN_FD_FRAME) {
        FD_MTU
    } else {
        MTU
    }
}

fn put_platform_long(buf: &mut [u8], offset: usize, value: i64) {
    if size_of::<libc::time_t>() == 8 {
        buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    } else {
        buf[offset..offset + 4].copy_from_slice(&(value as i32).to_ne_bytes());
    }
}

fn get_platform_long(buf: &[u8], offset: usize) -> i64 {
    if size_of::<libc::time_t>() == 8 {
        i64::from_ne_bytes(buf[offset..offset + 8].try_into().unwrap())
    } else {
        i32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as i64
    }
}

fn put_interval(buf: &mut [u8], offset: usize, interval: Duration) {
    put_platform_long(buf, offset + OFFSET_TV_SEC, interval.as_secs() as i64);
    put_platform_long(
        buf,
        offset + OFFSET_TV_USEC,
        interval.subsec_micros() as i64,
    );
}

fn get_interval(buf: &[u8], offset: usize) -> Duration {
    let sec = get_platform_long(buf, offset + OFFSET_TV_SEC);
    let usec = get_platform_long(buf, offset + OFFSET_TV_USEC);
    Duration::from_secs(sec as u64) + Duration::from_micros(usec as u64)
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// The message struct used to talk to the CAN broadcast manager.
///
/// Parsed instances are read-only views over the caller's buffer; built
/// instances own their buffer. Use [`BcmMessage::builder`] to construct one.
#[derive(Clone)]
pub struct BcmMessage<'a> {
    bytes: Cow<'a, [u8]>,
}

impl<'a> BcmMessage<'a> {
    /// Starts building a message for the given opcode.
    pub fn builder(opcode: BcmOpcode) -> BcmMessageBuilder<'a> {
        BcmMessageBuilder::new(opcode)
    }

    /// Parses a message from a buffer, e.g. one read from a BCM channel.
    ///
    /// The buffer may be larger than the message it holds; trailing bytes
    /// beyond the last frame slot are ignored. Every frame slot is validated
    /// here, so the frame accessors cannot fail on content afterwards.
    pub fn parse(buf: &'a [u8]) -> Result<Self, ValidationError> {
        if buf.len() < HEADER_LENGTH {
            return Err(ValidationError::BufferTooSmall {
                required: HEADER_LENGTH,
                available: buf.len(),
            });
        }

        BcmOpcode::try_from(get_u32(buf, OFFSET_OPCODE))?;

        let flags = BcmFlags::from_bits_truncate(get_u32(buf, OFFSET_FLAGS));
        let nframes = get_u32(buf, OFFSET_NFRAMES) as usize;
        let slot = slot_size(flags);

        let required = HEADER_LENGTH + nframes * slot;
        if buf.len() < required {
            return Err(ValidationError::BufferTooSmall {
                required,
                available: buf.len(),
            });
        }

        let message = BcmMessage {
            bytes: Cow::Borrowed(buf),
        };
        for index in 0..nframes {
            CanFrame::parse(message.slot_bytes(index, slot))?;
        }
        Ok(message)
    }

    /// Detaches the message from its backing buffer.
    pub fn to_owned(&self) -> BcmMessage<'static> {
        BcmMessage {
            bytes: Cow::Owned(self.bytes.clone().into_owned()),
        }
    }

    /// The OP-code of this message.
    pub fn opcode(&self) -> BcmOpcode {
        // validated in parse() or written by the builder
        BcmOpcode::try_from(get_u32(&self.bytes, OFFSET_OPCODE)).unwrap()
    }

    /// The flags of this message.
    pub fn flags(&self) -> BcmFlags {
        BcmFlags::from_bits_truncate(get_u32(&self.bytes, OFFSET_FLAGS))
    }

    /// The number of interval1 repetitions before interval2 takes over.
    pub fn count(&self) -> u32 {
        get_u32(&self.bytes, OFFSET_COUNT)
    }

    /// The first timer. For TX_SETUP the broadcast manager sends
    /// [`count`](Self::count) messages at this interval before switching to
    /// [`interval2`](Self::interval2); for RX_SETUP it is the timeout after
    /// which an RX_TIMEOUT notification fires.
    pub fn interval1(&self) -> Duration {
        get_interval(&self.bytes, OFFSET_IVAL1)
    }

    /// The second timer. For TX_SETUP the steady transmission interval; for
    /// RX_SETUP a throttle on RX_CHANGED notifications.
    pub fn interval2(&self) -> Duration {
        get_interval(&self.bytes, OFFSET_IVAL2)
    }

    /// The CAN id of this message.
    pub fn can_id(&self) -> u32 {
        get_u32(&self.bytes, OFFSET_CAN_ID)
    }

    /// The number of frame slots in this message.
    pub fn frame_count(&self) -> usize {
        get_u32(&self.bytes, OFFSET_NFRAMES) as usize
    }

    /// Returns a single frame of this message as a view into its buffer.
    pub fn frame(&self, index: usize) -> Result<CanFrame<'_>, Error> {
        let count = self.frame_count();
        if index >= count {
            return Err(Error::FrameIndexOutOfBounds { index, count });
        }
        Ok(CanFrame::view_unchecked(
            self.slot_bytes(index, slot_size(self.flags())),
        ))
    }

    /// Iterates over all frames in slot order. The iterator can be obtained
    /// again to restart; a message without frames yields nothing.
    pub fn frames(&self) -> BcmFrames<'_> {
        BcmFrames {
            message: self,
            index: 0,
        }
    }

    /// The raw message bytes, ready for a channel write.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn slot_bytes(&self, index: usize, slot: usize) -> &[u8] {
        let offset = HEADER_LENGTH + index * slot;
        &self.bytes[offset..offset + slot]
    }
}

/// Logical equality over the message content: header fields and frames,
/// ignoring trailing buffer padding.
impl PartialEq for BcmMessage<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.opcode() == other.opcode()
            && self.flags() == other.flags()
            && self.count() == other.count()
            && self.interval1() == other.interval1()
            && self.interval2() == other.interval2()
            && self.can_id() == other.can_id()
            && self.frames().eq(other.frames())
    }
}

impl Eq for BcmMessage<'_> {}

impl fmt::Debug for BcmMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BcmMessage")
            .field("opcode", &self.opcode())
            .field("flags", &self.flags())
            .field("count", &self.count())
            .field("interval1", &self.interval1())
            .field("interval2", &self.interval2())
            .field("can_id", &self.can_id())
            .field("frames", &self.frames().collect::<Vec<_>>())
            .finish()
    }
}

/// Iterator over the frames of a [`BcmMessage`].
#[derive(Clone)]
pub struct BcmFrames<'a> {
    message: &'a BcmMessage<'a>,
    index: usize,
}

impl<'a> Iterator for BcmFrames<'a> {
    type Item = CanFrame<'a>;

    fn next(&mut self) -> Option<CanFrame<'a>> {
        if self.index >= self.message.frame_count() {
            return None;
        }
        let slot = slot_size(self.message.flags());
        let frame = CanFrame::view_unchecked(self.message.slot_bytes(self.index, slot));
        self.index += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.message.frame_count().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BcmFrames<'_> {}

/// Incremental builder for [`BcmMessage`].
///
/// Frames are accumulated as views; nothing is laid out until
/// [`build`](Self::build), which is the only point where the uniform slot
/// size is decided.
pub struct BcmMessageBuilder<'a> {
    opcode: BcmOpcode,
    flags: BcmFlags,
    count: u32,
    interval1: Duration,
    interval2: Duration,
    can_id: u32,
    frames: Vec<CanFrame<'a>>,
}

impl<'a> BcmMessageBuilder<'a> {
    fn new(opcode: BcmOpcode) -> Self {
        Self {
            opcode,
            flags: BcmFlags::empty(),
            count: 0,
            interval1: Duration::ZERO,
            interval2: Duration::ZERO,
            can_id: 0,
            frames: Vec::new(),
        }
    }

    /// Adds message flags on top of the ones already set.
    pub fn flags(mut self, flags: BcmFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the interval1 repetition count.
    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Sets the first timer.
    pub fn interval1(mut self, interval: Duration) -> Self {
        self.interval1 = interval;
        self
    }

    /// Sets the second timer.
    pub fn interval2(mut self, interval: Duration) -> Self {
        self.interval2 = interval;
        self
    }

    /// Sets the CAN id the operation applies to.
    pub fn can_id(mut self, can_id: u32) -> Self {
        self.can_id = can_id;
        self
    }

    /// Appends one frame slot.
    pub fn frame(mut self, frame: CanFrame<'a>) -> Self {
        self.frames.push(frame);
        self
    }

    /// Appends several frame slots in order.
    pub fn frames(mut self, frames: impl IntoIterator<Item = CanFrame<'a>>) -> Self {
        self.frames.extend(frames);
        self
    }

    /// Materializes the message buffer.
    ///
    /// If any accumulated frame is an FD frame, [`BcmFlags::CAN_FD_FRAME`]
    /// is forced into the flags so the recorded slot size and the frames
    /// cannot disagree.
    pub fn build(self) -> BcmMessage<'static> {
        let mut flags = self.flags;
        if self.frames.iter().any(CanFrame::is_fd) {
            flags |= BcmFlags::CAN_FD_FRAME;
        }
        let slot = slot_size(flags);

        let mut bytes = vec![0u8; HEADER_LENGTH + self.frames.len() * slot];
        bytes[OFFSET_OPCODE..OFFSET_OPCODE + 4]
            .copy_from_slice(&(self.opcode as u32).to_ne_bytes());
        bytes[OFFSET_FLAGS..OFFSET_FLAGS + 4].copy_from_slice(&flags.bits().to_ne_bytes());
        bytes[OFFSET_COUNT..OFFSET_COUNT + 4].copy_from_slice(&self.count.to_ne_bytes());
        put_interval(&mut bytes, OFFSET_IVAL1, self.interval1);
        put_interval(&mut bytes, OFFSET_IVAL2, self.interval2);
        bytes[OFFSET_CAN_ID..OFFSET_CAN_ID + 4].copy_from_slice(&self.can_id.to_ne_bytes());
        bytes[OFFSET_NFRAMES..OFFSET_NFRAMES + 4]
            .copy_from_slice(&(self.frames.len() as u32).to_ne_bytes());

        for (index, frame) in self.frames.iter().enumerate() {
            let offset = HEADER_LENGTH + index * slot;
            // a classic frame widens into an FD slot; the reverse cannot
            // happen because any FD frame forces the FD slot size
            let source = frame.as_bytes();
            bytes[offset..offset + source.len()].copy_from_slice(source);
        }

        BcmMessage {
            bytes: Cow::Owned(bytes),
        }
    }
}
