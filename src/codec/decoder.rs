//! # Pump Packet Decoder
//!
//! Validates inbound pump packets and assembled multi-fragment pages.

use super::crc::{crc16, crc8, Crc16Variant};
use super::protocol::*;
use super::symbol;
use crate::error::{PacketError, PageError, Result};

/// Decode an inbound line-coded frame into a validated packet
///
/// The frame is what follows the stick's 2-byte link header.
///
/// # Arguments
///
/// * `frame` - 4b6b-encoded packet bytes
/// * `recipient` - Address byte the packet must carry
/// * `shape` - Whether byte 5 is a payload size or a fragment index
///
/// # Errors
///
/// Returns error if:
/// - The symbol stream is corrupt ([`crate::error::FrameError`])
/// - The recipient byte does not match ([`PacketError::BadRecipient`])
/// - Fewer than 7 bytes decoded ([`PacketError::ShortPacket`])
/// - The trailing CRC-8 is wrong ([`PacketError::CrcMismatch`])
pub fn parse_inbound(frame: &[u8], recipient: u8, shape: ResponseShape) -> Result<Packet> {
    let bytes = symbol::decode(frame)?;
    Ok(parse_plain(&bytes, recipient, shape)?)
}

/// Validate already symbol-decoded packet bytes
///
/// The recipient is checked before the CRC so that a packet for another
/// device is reported as such even when its checksum is fine.
pub fn parse_plain(bytes: &[u8], recipient: u8, shape: ResponseShape) -> std::result::Result<Packet, PacketError> {
    let Some(&found) = bytes.first() else {
        return Err(PacketError::ShortPacket { len: 0 });
    };

    if found != recipient {
        return Err(PacketError::BadRecipient {
            expected: recipient,
            found,
        });
    }

    if bytes.len() < MIN_INBOUND_SIZE {
        return Err(PacketError::ShortPacket { len: bytes.len() });
    }

    let crc_index = bytes.len() - 1;
    let received_crc = bytes[crc_index];
    let calculated_crc = crc8(&bytes[..crc_index]);

    if calculated_crc != received_crc {
        return Err(PacketError::CrcMismatch {
            expected: calculated_crc,
            found: received_crc,
        });
    }

    let header_byte = bytes[HEADER_BYTE_OFFSET];
    let body = &bytes[HEADER_BYTE_OFFSET + 1..crc_index];

    let (header, declared) = match shape {
        ResponseShape::Simple => (
            ResponseHeader::Simple {
                payload_size: header_byte,
            },
            header_byte as usize,
        ),
        ResponseShape::Fragment => (ResponseHeader::Fragment { index: header_byte }, FRAGMENT_PAYLOAD_SIZE),
    };

    if declared > body.len() {
        return Err(PacketError::TruncatedPayload {
            declared,
            available: body.len(),
        });
    }

    Ok(Packet {
        recipient: found,
        serial: PumpSerial([bytes[1], bytes[2], bytes[3]]),
        opcode: bytes[4],
        header,
        payload: body[..declared].to_vec(),
        crc: received_crc,
    })
}

/// Decode an outbound frame back into its fields
///
/// Outbound packets carry no size byte: everything between the opcode and
/// the CRC is payload. Used to inspect what was sent to the pump.
///
/// # Errors
///
/// Same recipient, length and CRC checks as [`parse_plain`], with a
/// 6-byte minimum (empty payload).
pub fn parse_outbound(frame: &[u8], recipient: u8) -> Result<OutboundPacket> {
    let bytes = symbol::decode(frame)?;

    let Some(&found) = bytes.first() else {
        return Err(PacketError::ShortPacket { len: 0 }.into());
    };
    if found != recipient {
        return Err(PacketError::BadRecipient {
            expected: recipient,
            found,
        }
        .into());
    }
    if bytes.len() < MIN_INBOUND_SIZE - 1 {
        return Err(PacketError::ShortPacket { len: bytes.len() }.into());
    }

    let crc_index = bytes.len() - 1;
    let calculated_crc = crc8(&bytes[..crc_index]);
    if calculated_crc != bytes[crc_index] {
        return Err(PacketError::CrcMismatch {
            expected: calculated_crc,
            found: bytes[crc_index],
        }
        .into());
    }

    Ok(OutboundPacket {
        recipient: found,
        serial: PumpSerial([bytes[1], bytes[2], bytes[3]]),
        opcode: bytes[4],
        payload: bytes[5..crc_index].to_vec(),
    })
}

/// Check an assembled page against its big-endian CRC-16 trailer
///
/// # Returns
///
/// * The page data without the trailer
///
/// # Errors
///
/// [`PageError::TooShort`] if there is no room for a trailer,
/// [`PageError::CrcMismatch`] if the trailer does not match.
pub fn check_page(page: &[u8], variant: Crc16Variant) -> std::result::Result<&[u8], PageError> {
    if page.len() < 2 {
        return Err(PageError::TooShort { len: page.len() });
    }

    let (data, trailer) = page.split_at(page.len() - 2);
    let found = u16::from_be_bytes([trailer[0], trailer[1]]);
    let expected = crc16(data, variant);

    if expected != found {
        return Err(PageError::CrcMismatch {
            variant,
            expected,
            found,
        });
    }

    Ok(data)
}
