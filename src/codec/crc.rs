//! # Checksum Tables
//!
//! CRC-8 for single radio packets and CRC-16 for assembled pages.
//!
//! **CRC-8 polynomial**: 0x9B, initial value 0x00, MSB first
//! **CRC-16 polynomial**: 0x1021, MSB first, two initial values (see [`Crc16Variant`])

/// CRC-8 polynomial used by pump packets
const CRC8_POLY: u8 = 0x9B;

/// CRC-16 polynomial used by history and CGM pages
const CRC16_POLY: u16 = 0x1021;

/// Precomputed CRC8 lookup table
pub const CRC8_TABLE: [u8; 256] = generate_crc8_table();

/// Precomputed CRC16 lookup table shared by both page variants
pub const CRC16_TABLE: [u16; 256] = generate_crc16_table();

/// Generate CRC8 lookup table at compile time
const fn generate_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Generate CRC16 lookup table at compile time
const fn generate_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Page checksum flavour.
///
/// Pump history pages and CGM pages were historically validated with
/// different CRC-16 routines. Both are kept selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crc16Variant {
    /// CGM pages: register starts at 0x0000
    Legacy,
    /// Pump history pages: register starts at 0xFFFF
    Revised,
}

impl Crc16Variant {
    /// Initial register value for this variant
    pub const fn initial(self) -> u16 {
        match self {
            Self::Legacy => 0x0000,
            Self::Revised => 0xFFFF,
        }
    }
}

/// Calculate the packet CRC-8 using the lookup table
///
/// # Arguments
///
/// * `data` - Bytes to checksum (recipient + serial + opcode + payload)
///
/// # Examples
///
/// ```
/// use pumplink::codec::crc::crc8;
///
/// assert_eq!(crc8(&[0xA7, 0x79, 0x91, 0x63, 0x5D, 0x01, 0x0A]), 0x0D);
/// ```
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;

    for &byte in data {
        crc = CRC8_TABLE[(crc ^ byte) as usize];
    }

    crc
}

/// Calculate a page CRC-16 with the given variant
///
/// Running shift/XOR over the whole slice. Callers pass the page without its
/// own 2-byte trailer.
pub fn crc16(data: &[u8], variant: Crc16Variant) -> u16 {
    let mut crc = variant.initial();

    for &byte in data {
        let index = ((crc >> 8) as u8 ^ byte) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[index];
    }

    crc
}

/// Bitwise CRC-8, used to check the table
#[allow(dead_code)]
fn crc8_slow(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;

    for &byte in data {
        crc ^= byte;

        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}
