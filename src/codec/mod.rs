//! # Pump Packet Codec
//!
//! Bit-level encoding of the pump's radio packets.
//!
//! This module handles:
//! - 4b6b symbol encoding and decoding
//! - Outbound packet framing (recipient, serial, opcode, payload, CRC-8)
//! - Inbound packet validation (recipient, length, CRC-8, header shape)
//! - CRC-16 checks over assembled multi-fragment pages

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod crc;
pub mod symbol;
