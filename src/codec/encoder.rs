//! # Pump Packet Encoder
//!
//! Builds outbound pump packets ready to hand to the radio stick.

use bytes::{BufMut, BytesMut};

use super::crc::crc8;
use super::protocol::*;
use super::symbol;
use crate::error::{PumpLinkError, Result};

/// Build the plain (not yet line-coded) packet bytes
///
/// Layout: recipient + serial + opcode + payload + CRC-8 over all of it.
///
/// # Errors
///
/// Returns a decode error if the payload exceeds [`MAX_PAYLOAD_SIZE`]
pub fn build_plain(opcode: u8, payload: &[u8], serial: PumpSerial, recipient: u8) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PumpLinkError::Decode(format!(
            "payload size {} exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut packet = BytesMut::with_capacity(1 + 3 + 1 + payload.len() + 1);
    packet.put_u8(recipient);
    packet.put_slice(&serial.0);
    packet.put_u8(opcode);
    packet.put_slice(payload);

    let crc = crc8(&packet);
    packet.put_u8(crc);

    Ok(packet.to_vec())
}

/// Build a complete outbound frame
///
/// # Arguments
///
/// * `opcode` - Pump command code
/// * `payload` - Command parameters (0-64 bytes)
/// * `serial` - Target pump serial
/// * `recipient` - Device address byte ([`PUMP_RECIPIENT`] for the pump)
///
/// # Returns
///
/// * `Result<Vec<u8>>` - 4b6b-encoded frame
///
/// # Examples
///
/// ```
/// use pumplink::codec::encoder::build_outbound;
/// use pumplink::codec::protocol::{PumpSerial, PUMP_RECIPIENT};
///
/// let serial = PumpSerial([0x79, 0x91, 0x63]);
/// let frame = build_outbound(0x5D, &[0x01, 0x0A], serial, PUMP_RECIPIENT).unwrap();
/// assert_eq!(frame.len(), 12);
/// ```
pub fn build_outbound(opcode: u8, payload: &[u8], serial: PumpSerial, recipient: u8) -> Result<Vec<u8>> {
    let plain = build_plain(opcode, payload, serial, recipient)?;
    Ok(symbol::encode(&plain)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: PumpSerial = PumpSerial([0x79, 0x91, 0x63]);

    #[test]
    fn test_build_plain_layout() {
        let plain = build_plain(0x5D, &[0x01, 0x0A], SERIAL, PUMP_RECIPIENT).unwrap();
        assert_eq!(plain, vec![0xA7, 0x79, 0x91, 0x63, 0x5D, 0x01, 0x0A, 0x0D]);
    }

    #[test]
    fn test_build_outbound_golden_vector() {
        let frame = build_outbound(0x5D, &[0x01, 0x0A], SERIAL, PUMP_RECIPIENT).unwrap();
        assert_eq!(
            frame,
            vec![0xA9, 0x65, 0x99, 0x67, 0x19, 0xA3, 0x94, 0xD5, 0x71, 0x56, 0xA5, 0x4D]
        );
    }

    #[test]
    fn test_build_outbound_empty_payload() {
        let frame = build_outbound(0x5D, &[], SERIAL, PUMP_RECIPIENT).unwrap();
        assert_eq!(frame, vec![0xA9, 0x65, 0x99, 0x67, 0x19, 0xA3, 0x94, 0xD2, 0xF1]);
    }

    #[test]
    fn test_build_outbound_payload_too_large() {
        let result = build_outbound(0x80, &[0u8; 65], SERIAL, PUMP_RECIPIENT);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_outbound_max_payload() {
        let frame = build_outbound(0x80, &[0u8; 64], SERIAL, PUMP_RECIPIENT).unwrap();
        // 70 plain bytes, 12 bits each
        assert_eq!(frame.len(), 105);
    }
}
