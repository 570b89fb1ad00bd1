//! # Pump Packet Constants and Types
//!
//! Core definitions for the pump radio packet.
//!
//! ```text
//! outbound: [recipient:1][serial:3][opcode:1][payload:0..64][crc8:1]
//! inbound:  [recipient:1][serial:3][opcode:1][size|index:1][payload][crc8:1]
//! ```

use crate::error::{PumpLinkError, Result};

/// Recipient byte addressing the pump
pub const PUMP_RECIPIENT: u8 = 0xA7;

/// Pump acknowledgement opcode
pub const OPCODE_ACK: u8 = 0x06;

/// Pump negative-acknowledgement opcode
pub const OPCODE_NAK: u8 = 0x15;

/// Response bytes 4..6 of a successful Set: ACK opcode, zero payload size
pub const ACK_SEQUENCE: [u8; 2] = [OPCODE_ACK, 0x00];

/// Maximum outbound payload size
pub const MAX_PAYLOAD_SIZE: usize = 64;

/// Fixed payload window of a big-transfer fragment
pub const FRAGMENT_PAYLOAD_SIZE: usize = 64;

/// recipient + serial + opcode + size/index + crc
pub const MIN_INBOUND_SIZE: usize = 7;

/// Offset of the byte after the opcode (payload size or fragment index)
pub const HEADER_BYTE_OFFSET: usize = 5;

/// Default terminal-fragment threshold for the fragment index byte
pub const DEFAULT_END_MARKER: u8 = 0x80;

/// Three-byte pump serial number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PumpSerial(pub [u8; 3]);

impl PumpSerial {
    /// Parse the six hex digits printed on the pump label
    ///
    /// # Errors
    ///
    /// Returns a decode error unless the string is exactly six hex digits
    ///
    /// # Examples
    ///
    /// ```
    /// use pumplink::codec::protocol::PumpSerial;
    ///
    /// let serial = PumpSerial::parse("799163").unwrap();
    /// assert_eq!(serial.0, [0x79, 0x91, 0x63]);
    /// ```
    pub fn parse(digits: &str) -> Result<Self> {
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PumpLinkError::Decode(format!(
                "pump serial must be 6 hex digits, got {:?}",
                digits
            )));
        }

        let mut serial = [0u8; 3];
        for (i, byte) in serial.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|e| PumpLinkError::Decode(e.to_string()))?;
        }
        Ok(Self(serial))
    }
}

impl std::fmt::Display for PumpSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

/// Which header shape an inbound packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Byte 5 is a payload size bounding the payload slice
    Simple,
    /// Byte 5 is a fragment index, payload is a fixed 64-byte window
    Fragment,
}

/// Decoded byte 5 of an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHeader {
    Simple { payload_size: u8 },
    Fragment { index: u8 },
}

impl ResponseHeader {
    /// Raw value of the header byte
    pub fn raw(&self) -> u8 {
        match *self {
            Self::Simple { payload_size } => payload_size,
            Self::Fragment { index } => index,
        }
    }
}

/// A validated inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub recipient: u8,
    pub serial: PumpSerial,
    pub opcode: u8,
    pub header: ResponseHeader,
    pub payload: Vec<u8>,
    /// CRC-8 as received (already checked against a fresh computation)
    pub crc: u8,
}

impl Packet {
    /// Whether this is the pump's positive acknowledgement
    pub fn is_acknowledgement(&self) -> bool {
        [self.opcode, self.header.raw()] == ACK_SEQUENCE
    }
}

/// Fields of an outbound packet, as read back from a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub recipient: u8,
    pub serial: PumpSerial,
    pub opcode: u8,
    pub payload: Vec<u8>,
}
