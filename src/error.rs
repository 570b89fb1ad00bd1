//! # Error Types
//!
//! Error taxonomy for the pump link stack using `thiserror`.
//!
//! Each protocol layer owns one error enum; [`PumpLinkError`] wraps them so
//! callers can match on the layer that failed. Integrity failures are never
//! downgraded to default values.

use thiserror::Error;

use crate::codec::crc::Crc16Variant;

/// Failures of the local USB/serial link.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No serial device matched the configured path or USB ids
    #[error("no radio stick found (tried: {0})")]
    DeviceNotFound(String),

    /// The device was found but could not be opened or configured
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    /// Nothing arrived before the read deadline
    #[error("read timed out after {waited_ms} ms with no data")]
    ReadTimeout { waited_ms: u64 },

    /// The stream ended in the middle of a read
    #[error("read interrupted: link closed mid-frame")]
    Interrupted,

    /// Underlying port I/O error
    #[error("port I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-byte status codes the stick returns in place of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RadioStatus {
    #[error("radio timeout (0xAA)")]
    Timeout,

    #[error("radio command interrupted (0xBB)")]
    Interrupted,

    #[error("radio received no data (0xCC)")]
    NoData,
}

impl RadioStatus {
    /// Interpret a one-byte reply as a radio status code, if it is one.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0xAA => Some(Self::Timeout),
            0xBB => Some(Self::Interrupted),
            0xCC => Some(Self::NoData),
            _ => None,
        }
    }

    /// Wire value of the status code.
    pub fn code(self) -> u8 {
        match self {
            Self::Timeout => 0xAA,
            Self::Interrupted => 0xBB,
            Self::NoData => 0xCC,
        }
    }
}

/// 4b6b symbol stream errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("corrupted frame: 6-bit group 0b{group:06b} at bit {offset} is not a symbol")]
    CorruptedFrame { offset: usize, group: u8 },

    #[error("malformed frame ending: 0b{group:b}")]
    MalformedEnding { group: u8 },

    #[error("missing bits: {bits} bits do not pack into whole bytes")]
    MissingBits { bits: usize },

    #[error("odd number of decoded nibbles")]
    DanglingNibble,
}

/// Per-packet validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("bad recipient: expected 0x{expected:02X}, found 0x{found:02X}")]
    BadRecipient { expected: u8, found: u8 },

    #[error("short packet: {len} bytes")]
    ShortPacket { len: usize },

    #[error("CRC-8 mismatch: computed 0x{expected:02X}, received 0x{found:02X}")]
    CrcMismatch { expected: u8, found: u8 },

    #[error("payload truncated: header declares {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },
}

/// Errors over an assembled multi-fragment page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("{variant:?} CRC-16 mismatch: computed 0x{expected:04X}, trailer 0x{found:04X}")]
    CrcMismatch {
        variant: Crc16Variant,
        expected: u16,
        found: u16,
    },

    #[error("page too short for a CRC-16 trailer: {len} bytes")]
    TooShort { len: usize },
}

/// Command-level protocol failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The exchange failed and no retry budget could recover it
    #[error("{command}: unsuccessful command")]
    UnsuccessfulCommand {
        command: &'static str,
        #[source]
        source: Box<PumpLinkError>,
    },

    /// A Set command was answered with something other than the ACK sequence
    #[error("{command}: response was not an acknowledgement")]
    NotAcknowledged { command: &'static str },

    #[error("{command}: {budget} budget exhausted")]
    BudgetExhausted {
        command: &'static str,
        budget: &'static str,
    },

    #[error("opcode 0x{0:02X} has no known response shape")]
    UnsupportedOpcode(u8),

    #[error("response opcode 0x{found:02X} does not answer 0x{expected:02X}")]
    UnexpectedOpcode { expected: u8, found: u8 },

    #[error("fragment out of order: expected #{expected}, got #{found}")]
    FragmentOutOfOrder { expected: u8, found: u8 },

    #[error("duplicate fragment #{0}")]
    DuplicateFragment(u8),
}

/// Frequency synthesis and channel scan failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TuningError {
    #[error("radio register 0x{register:02X} write failed: wrote 0x{wrote:02X}, read back 0x{read:02X}")]
    RegisterWriteFailed { register: u8, wrote: u8, read: u8 },

    #[error("frequency range {low:.3}-{high:.3} MHz is outside every known region")]
    UnknownFrequencyRange { low: f64, high: f64 },

    #[error("no pump answered anywhere in the scanned band")]
    NoDeviceFound,

    #[error("invalid scan parameters: {0}")]
    InvalidScan(String),
}

/// Main error type for the pump link stack
#[derive(Debug, Error)]
pub enum PumpLinkError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("radio status: {0}")]
    RadioStatus(#[from] RadioStatus),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("page error: {0}")]
    Page(#[from] PageError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("tuning error: {0}")]
    Tuning(#[from] TuningError),

    /// Response payload did not have the shape its decoder expects
    #[error("decode error: {0}")]
    Decode(String),

    /// Request parameter the pump cannot represent
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PumpLinkError {
    /// Whether the failure happened on the radio hop or while validating a
    /// received packet. Only these are worth a NAK.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RadioStatus(_) | Self::Frame(_) | Self::Packet(_)
        )
    }
}

/// Result type alias for the pump link stack
pub type Result<T> = std::result::Result<T, PumpLinkError>;
