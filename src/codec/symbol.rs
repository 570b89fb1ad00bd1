//! # 4b6b Symbol Codec
//!
//! The pump radio never sends raw bytes. Every nibble travels as one of
//! sixteen 6-bit codes (each with exactly three bits set), most significant
//! nibble first. A 4-bit terminator `0101` pads a frame whose symbol bits do
//! not fill the last byte.
//!
//! ```text
//! 0xA7  ->  nibble A = 101010, nibble 7 = 010110
//! ```

use crate::error::FrameError;

/// 6-bit code for each nibble value
pub const SYMBOL_TABLE: [u8; 16] = [
    0x15, 0x31, 0x32, 0x23, 0x34, 0x25, 0x26, 0x16, 0x1A, 0x19, 0x2A, 0x0B, 0x2C, 0x0D, 0x0E, 0x1C,
];

/// End-of-frame marker appended after the last symbol
pub const TERMINATOR: u8 = 0b0101;

/// Terminator as it appears in a 6-bit window, followed by zero fill
const TERMINATOR_GROUP: u8 = TERMINATOR << 2;

/// Bits per symbol
const SYMBOL_BITS: usize = 6;

/// Bits in the terminator
const TERMINATOR_BITS: usize = 4;

/// Reverse lookup: 6-bit code to nibble
fn nibble_of(code: u8) -> Option<u8> {
    SYMBOL_TABLE
        .iter()
        .position(|&symbol| symbol == code)
        .map(|nibble| nibble as u8)
}

/// Accumulates bits MSB first into whole bytes
struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    pending: usize,
    total: usize,
}

impl BitWriter {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            out: Vec::with_capacity(bytes),
            acc: 0,
            pending: 0,
            total: 0,
        }
    }

    fn push(&mut self, value: u8, bits: usize) {
        self.acc = (self.acc << bits) | u32::from(value);
        self.pending += bits;
        self.total += bits;

        while self.pending >= 8 {
            self.pending -= 8;
            self.out.push((self.acc >> self.pending) as u8);
        }
        self.acc &= (1 << self.pending) - 1;
    }

    fn finish(self) -> Result<Vec<u8>, FrameError> {
        if self.pending != 0 {
            return Err(FrameError::MissingBits { bits: self.total });
        }
        Ok(self.out)
    }
}

/// Encode bytes into the radio line code
///
/// # Errors
///
/// Returns [`FrameError::MissingBits`] if the symbol stream plus terminator
/// does not pack into whole bytes. With 12 bits per input byte that cannot
/// happen for any input; it guards the bit packing itself.
///
/// # Examples
///
/// ```
/// use pumplink::codec::symbol::encode;
///
/// let frame = encode(&[0xA7]).unwrap();
/// // 101010 010110 0101 -> 1010 1001 0110 0101
/// assert_eq!(frame, vec![0xA9, 0x65]);
/// ```
pub fn encode(bytes: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut writer = BitWriter::with_capacity(bytes.len() * 3 / 2 + 1);

    for &byte in bytes {
        writer.push(SYMBOL_TABLE[(byte >> 4) as usize], SYMBOL_BITS);
        writer.push(SYMBOL_TABLE[(byte & 0x0F) as usize], SYMBOL_BITS);
    }

    if writer.total % 8 != 0 {
        writer.push(TERMINATOR, TERMINATOR_BITS);
    }

    writer.finish()
}

/// Decode a radio line-coded frame into nibbles
///
/// Stops at the terminator (or zero fill). Each full 6-bit group before it
/// must be a table symbol.
///
/// # Errors
///
/// - [`FrameError::CorruptedFrame`] for an unknown group with more bits after it
/// - [`FrameError::MalformedEnding`] for an unknown final group
pub fn decode_nibbles(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total_bits = frame.len() * 8;
    let mut nibbles = Vec::with_capacity(total_bits / SYMBOL_BITS);
    let mut offset = 0;

    while total_bits - offset >= SYMBOL_BITS {
        let group = read_bits(frame, offset, SYMBOL_BITS);

        if let Some(nibble) = nibble_of(group) {
            nibbles.push(nibble);
            offset += SYMBOL_BITS;
            continue;
        }

        if group == TERMINATOR_GROUP || group == 0 {
            return Ok(nibbles);
        }

        if total_bits - offset - SYMBOL_BITS >= SYMBOL_BITS {
            return Err(FrameError::CorruptedFrame { offset, group });
        }
        return Err(FrameError::MalformedEnding { group });
    }

    let tail_bits = total_bits - offset;
    if tail_bits > 0 {
        let tail = read_bits(frame, offset, tail_bits);
        if tail != 0 && !is_terminator_tail(tail, tail_bits) {
            return Err(FrameError::MalformedEnding { group: tail });
        }
    }

    Ok(nibbles)
}

/// Decode a radio line-coded frame into bytes
///
/// # Errors
///
/// Any [`decode_nibbles`] error, or [`FrameError::DanglingNibble`] when the
/// symbols do not pair up into bytes.
///
/// # Examples
///
/// ```
/// use pumplink::codec::symbol::{decode, encode};
///
/// let bytes = [0xA7, 0x79, 0x91];
/// assert_eq!(decode(&encode(&bytes).unwrap()).unwrap(), bytes.to_vec());
/// ```
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let nibbles = decode_nibbles(frame)?;

    if nibbles.len() % 2 != 0 {
        return Err(FrameError::DanglingNibble);
    }

    Ok(nibbles
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect())
}

/// A trailing partial group (< 6 bits) must be the terminator, cut short or
/// followed by zeros.
fn is_terminator_tail(tail: u8, bits: usize) -> bool {
    if bits >= TERMINATOR_BITS {
        tail >> (bits - TERMINATOR_BITS) == TERMINATOR && tail & ((1 << (bits - TERMINATOR_BITS)) - 1) == 0
    } else {
        tail == TERMINATOR >> (TERMINATOR_BITS - bits)
    }
}

/// Read `count` (<= 8) bits MSB first starting at bit `offset`
fn read_bits(frame: &[u8], offset: usize, count: usize) -> u8 {
    let mut value = 0u8;
    for bit in offset..offset + count {
        let set = (frame[bit / 8] >> (7 - bit % 8)) & 1;
        value = (value << 1) | set;
    }
    value
}
