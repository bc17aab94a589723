use std::io;

use thiserror::Error;

/// A value-level contract was violated before touching the native boundary.
///
/// These errors are always raised locally and synchronously; nothing has been
/// handed to the kernel yet when one of them is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Standard frame ids carry 11 bits.
    #[error("standard CAN id {id:#05x} exceeds 11 bits")]
    StandardIdTooLarge { id: u32 },

    /// Extended frame ids carry 29 bits.
    #[error("extended CAN id {id:#010x} exceeds 29 bits")]
    ExtendedIdTooLarge { id: u32 },

    /// Payload does not fit the addressing mode (8 bytes classic, 64 FD).
    #[error("payload of {length} bytes exceeds the maximum of {max}")]
    PayloadTooLong { length: usize, max: usize },

    /// The buffer does not contain enough bytes for the implied structure.
    #[error("buffer of {available} bytes cannot hold {required} bytes")]
    BufferTooSmall { required: usize, available: usize },

    /// A frame view must cover exactly one MTU worth of bytes.
    #[error("frame buffer of {length} bytes is neither CAN_MTU nor CANFD_MTU")]
    InvalidFrameLength { length: usize },

    /// The length byte of a frame slot exceeds what the slot can hold.
    #[error("frame declares {length} data bytes but its slot holds at most {max}")]
    DataLengthExceedsSlot { length: usize, max: usize },

    /// The opcode field of a BCM message matches no known operation.
    #[error("unknown BCM op-code: {opcode}")]
    UnknownOpcode { opcode: u32 },

    /// ISO-TP link layer MTU must be one of the two frame sizes.
    #[error("link layer MTU must be either {classic} or {fd}, not {mtu}", classic = libc::CAN_MTU, fd = libc::CANFD_MTU)]
    InvalidLinkLayerMtu { mtu: u8 },

    /// The transmission data length must be a member of the padding table.
    #[error("transmission data length {tx_dl} is not properly padded")]
    UnpaddedDataLength { tx_dl: u8 },

    /// A data length above 8 requires the FD MTU.
    #[error("only FD frames support a data length of {tx_dl}")]
    DataLengthRequiresFd { tx_dl: u8 },

    /// Transmission flags are only meaningful for FD frames.
    #[error("only FD frames support transmission flags")]
    FlagsRequireFd,

    /// The kernel accepts a bounded number of CAN filters per socket.
    #[error("a maximum of {max} filters are supported, got {count}")]
    TooManyFilters { count: usize, max: usize },
}

/// The native boundary reported a failure for a syscall.
#[derive(Error, Debug)]
#[error("{op} failed: {source}")]
pub struct NativeError {
    /// Name of the failed operation.
    pub op: &'static str,
    /// The errno-derived error as reported by the OS.
    #[source]
    pub source: io::Error,
}

impl NativeError {
    pub(crate) fn last(op: &'static str) -> Self {
        Self {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// The raw OS error number, if one was captured.
    pub fn errno(&self) -> Option<i32> {
        self.source.raw_os_error()
    }

    /// Whether the caller may retry the operation (EAGAIN/EWOULDBLOCK).
    ///
    /// The library never retries on its own; blocking behaviour stays
    /// whatever the caller configured on the socket.
    pub fn is_retryable(&self) -> bool {
        matches!(self.errno(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
    }
}

/// Possible errors
#[derive(Error, Debug)]
pub enum Error {
    /// CAN device could not be found
    #[error("failed to find CAN device: {source:?}")]
    Lookup {
        #[from]
        source: nix::Error,
    },

    /// A local validation check rejected a value.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A syscall failed.
    #[error(transparent)]
    Native(#[from] NativeError),

    /// Operation attempted on an already-closed channel, selector or
    /// registration.
    #[error("{0} is already closed")]
    Closed(&'static str),

    /// Out-of-range frame access in a BCM message.
    #[error("frame index {index} out of bounds for a message with {count} frames")]
    FrameIndexOutOfBounds { index: usize, count: usize },

    /// The channel's handle is not one the selector can poll.
    #[error("channel handle is not supported by this selector")]
    UnsupportedHandle,

    /// The registration value no longer describes the current registration.
    #[error("registration has been superseded")]
    StaleRegistration,

    /// The channel is already tracked by the listener.
    #[error("channel is already registered")]
    AlreadyRegistered,

    /// The channel is not tracked by the listener.
    #[error("channel is not registered")]
    NotRegistered,

    /// Releasing the selector resources failed; both release attempts are
    /// made, the earlier failure rides along as the suppressed cause.
    #[error("failed to release selector resources: {primary}")]
    ShutdownFailed {
        #[source]
        primary: NativeError,
        suppressed: Option<NativeError>,
    },
}
