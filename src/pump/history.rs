//! # History and CGM Pages
//!
//! A page is 1022 data bytes followed by a big-endian CRC-16. Pump history
//! pages use the revised CRC variant, CGM pages the legacy one.
//!
//! History records have no length field and no framing: each starts with a
//! type byte whose layout is known in advance. The scanner tries the layout
//! for the byte at the current offset and advances past the record if it
//! fits, or by one byte if it does not.
//!
//! ```text
//! [type][head fields...][timestamp:5][body fields...]
//! ```

use chrono::{NaiveDate, NaiveDateTime};
use tracing::trace;

use crate::codec::crc::Crc16Variant;
use crate::codec::decoder::check_page;
use crate::error::{PumpLinkError, Result};

/// Assembled page size including the CRC-16 trailer
pub const PAGE_SIZE: usize = 1024;

const TIMESTAMP_SIZE: usize = 5;

/// Decoded history event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryEvent {
    Bolus {
        programmed: f64,
        delivered: f64,
        /// Square-wave duration; zero for a normal bolus
        duration_minutes: u16,
    },
    Prime {
        fixed: f64,
        amount: f64,
    },
    Suspend,
    Resume,
    Rewind,
    ChangeTime,
    NewTime,
    TempBasal {
        rate: f64,
        percent: bool,
    },
    TempBasalDuration {
        minutes: u16,
    },
    BasalProfileStart {
        offset_minutes: u16,
        rate: f64,
    },
}

/// One history record
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    /// Byte offset of the record within the page
    pub offset: usize,
    pub timestamp: NaiveDateTime,
    pub event: HistoryEvent,
    pub raw: Vec<u8>,
}

/// Field layout of one record type
struct RecordLayout {
    kind: u8,
    head: usize,
    body: usize,
    decode: fn(&[u8], &[u8]) -> Option<HistoryEvent>,
}

impl RecordLayout {
    fn len(&self) -> usize {
        self.head + TIMESTAMP_SIZE + self.body
    }
}

const LAYOUTS: &[RecordLayout] = &[
    RecordLayout {
        kind: 0x01,
        head: 8,
        body: 0,
        decode: |head, _| {
            Some(HistoryEvent::Bolus {
                programmed: f64::from(u16::from_be_bytes([head[1], head[2]])) / 40.0,
                delivered: f64::from(u16::from_be_bytes([head[3], head[4]])) / 40.0,
                duration_minutes: u16::from(head[7]) * 30,
            })
        },
    },
    RecordLayout {
        kind: 0x03,
        head: 5,
        body: 0,
        decode: |head, _| {
            Some(HistoryEvent::Prime {
                fixed: f64::from(head[2]) / 10.0,
                amount: f64::from(head[4]) / 10.0,
            })
        },
    },
    RecordLayout {
        kind: 0x16,
        head: 2,
        body: 0,
        decode: |head, _| {
            let minutes = u16::from(head[1]) * 30;
            (minutes <= 24 * 60).then_some(HistoryEvent::TempBasalDuration { minutes })
        },
    },
    RecordLayout {
        kind: 0x17,
        head: 2,
        body: 0,
        decode: |_, _| Some(HistoryEvent::ChangeTime),
    },
    RecordLayout {
        kind: 0x18,
        head: 2,
        body: 0,
        decode: |_, _| Some(HistoryEvent::NewTime),
    },
    RecordLayout {
        kind: 0x1E,
        head: 2,
        body: 0,
        decode: |_, _| Some(HistoryEvent::Suspend),
    },
    RecordLayout {
        kind: 0x1F,
        head: 2,
        body: 0,
        decode: |_, _| Some(HistoryEvent::Resume),
    },
    RecordLayout {
        kind: 0x21,
        head: 2,
        body: 0,
        decode: |_, _| Some(HistoryEvent::Rewind),
    },
    RecordLayout {
        kind: 0x33,
        head: 2,
        body: 1,
        decode: |head, body| {
            let percent = body[0] & 0x08 != 0;
            let rate = if percent {
                f64::from(head[1])
            } else {
                f64::from((u16::from(body[0] & 0x07) << 8) | u16::from(head[1])) / 40.0
            };
            Some(HistoryEvent::TempBasal { rate, percent })
        },
    },
    RecordLayout {
        kind: 0x7B,
        head: 2,
        body: 3,
        decode: |_, body| {
            let slot = body[0];
            (slot < 48).then(|| HistoryEvent::BasalProfileStart {
                offset_minutes: u16::from(slot) * 30,
                rate: f64::from(u16::from_le_bytes([body[1], body[2]])) / 40.0,
            })
        },
    },
];

/// Decode the pump's packed 5-byte timestamp
///
/// ```text
/// byte 0: month bits 3..2 (<< 4) | seconds
/// byte 1: month bits 1..0 (<< 6) | minutes
/// byte 2: hour       byte 3: day       byte 4: year - 2000
/// ```
pub fn decode_timestamp(bytes: &[u8]) -> Option<NaiveDateTime> {
    let [b0, b1, b2, b3, b4] = <[u8; TIMESTAMP_SIZE]>::try_from(bytes.get(..TIMESTAMP_SIZE)?).ok()?;

    let second = u32::from(b0 & 0x3F);
    let minute = u32::from(b1 & 0x3F);
    let hour = u32::from(b2 & 0x1F);
    let day = u32::from(b3 & 0x1F);
    let month = u32::from(((b0 >> 4) & 0x0C) | (b1 >> 6));
    let year = 2000 + i32::from(b4 & 0x7F);

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

/// Try to read one record at the start of `bytes`
fn match_record(bytes: &[u8], offset: usize) -> Option<HistoryRecord> {
    let kind = *bytes.first()?;
    let layout = LAYOUTS.iter().find(|layout| layout.kind == kind)?;
    let raw = bytes.get(..layout.len())?;

    let head = &raw[..layout.head];
    let timestamp = decode_timestamp(&raw[layout.head..])?;
    let body = &raw[layout.head + TIMESTAMP_SIZE..];
    let event = (layout.decode)(head, body)?;

    Some(HistoryRecord {
        offset,
        timestamp,
        event,
        raw: raw.to_vec(),
    })
}

/// Iterator over the records of a history page
pub struct HistoryRecords<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Iterator for HistoryRecords<'_> {
    type Item = HistoryRecord;

    fn next(&mut self) -> Option<HistoryRecord> {
        while self.offset < self.data.len() {
            let rest = &self.data[self.offset..];
            if rest.iter().all(|&b| b == 0) {
                break;
            }

            if let Some(record) = match_record(rest, self.offset) {
                self.offset += record.raw.len();
                return Some(record);
            }
            trace!("No record at offset {} (0x{:02X})", self.offset, rest[0]);
            self.offset += 1;
        }

        self.offset = self.data.len();
        None
    }
}

fn checked_data(page: &[u8], variant: Crc16Variant) -> Result<Vec<u8>> {
    if page.len() != PAGE_SIZE {
        return Err(PumpLinkError::Decode(format!(
            "page has {} bytes, expected {}",
            page.len(),
            PAGE_SIZE
        )));
    }
    Ok(check_page(page, variant)?.to_vec())
}

/// A CRC-checked pump history page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    data: Vec<u8>,
}

impl HistoryPage {
    /// Validate an assembled page
    ///
    /// # Errors
    ///
    /// A decode error for a page that is not 1024 bytes, a page error if
    /// the revised CRC-16 does not match.
    pub fn parse(page: &[u8]) -> Result<Self> {
        Ok(Self {
            data: checked_data(page, Crc16Variant::Revised)?,
        })
    }

    /// Data bytes without the trailer
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn records(&self) -> HistoryRecords<'_> {
        HistoryRecords {
            data: &self.data,
            offset: 0,
        }
    }
}

/// A CRC-checked CGM page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgmPage {
    data: Vec<u8>,
}

impl CgmPage {
    /// Validate an assembled page against the legacy CRC-16
    pub fn parse(page: &[u8]) -> Result<Self> {
        Ok(Self {
            data: checked_data(page, Crc16Variant::Legacy)?,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the page holds nothing but padding
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}
