//! # Response Decoders and Request Encoders
//!
//! Typed views of pump response payloads, and the payloads of the commands
//! that change pump state. Insulin amounts travel as pump strokes.
//!
//! Every decoder rejects a payload that is too short or holds out-of-range
//! values instead of guessing.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::command::Response;
use crate::error::{PumpLinkError, Result};

/// Strokes per unit of insulin on current pumps
pub const STROKES_PER_UNIT: f64 = 40.0;

/// Strokes per unit in the 2-byte reservoir reply of older pumps
pub const LEGACY_STROKES_PER_UNIT: f64 = 10.0;

/// Schedules are laid out in half-hour slots
const SLOT_MINUTES: u32 = 30;
const SLOTS_PER_DAY: u8 = 48;

/// Highest temporary basal rate accepted, units per hour
pub const MAX_TEMP_BASAL_RATE: f64 = 35.0;

/// Longest temporary basal, minutes
pub const MAX_TEMP_BASAL_MINUTES: u16 = 24 * 60;

/// Largest single bolus accepted, units
pub const MAX_BOLUS_UNITS: f64 = 25.0;

/// Battery state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub low: bool,
    pub volts: f64,
}

/// Blood glucose units of a settings schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlucoseUnits {
    MgDl,
    MmolL,
}

impl GlucoseUnits {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::MgDl),
            2 => Ok(Self::MmolL),
            other => Err(decode_error(format!("unknown glucose units 0x{:02X}", other))),
        }
    }

    /// Scale a raw schedule value; mmol/L values are stored in tenths
    fn scale(self, raw: u16) -> f64 {
        match self {
            Self::MgDl => f64::from(raw),
            Self::MmolL => f64::from(raw) / 10.0,
        }
    }
}

/// Carbohydrate units of the carb ratio schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarbUnits {
    Grams,
    Exchanges,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BgTarget {
    pub start: NaiveTime,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BgTargets {
    pub units: GlucoseUnits,
    pub targets: Vec<BgTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sensitivity {
    pub start: NaiveTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensitivitySchedule {
    pub units: GlucoseUnits,
    pub sensitivities: Vec<Sensitivity>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarbRatio {
    pub start: NaiveTime,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CarbRatioSchedule {
    pub units: CarbUnits,
    pub ratios: Vec<CarbRatio>,
}

/// One slot of a basal profile, in units per hour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalSlot {
    pub start: NaiveTime,
    pub rate: f64,
}

/// Stored basal profiles, each read with its own opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasalProfile {
    Standard,
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempBasalKind {
    /// Units per hour
    Absolute(f64),
    /// Percent of the scheduled rate
    Percent(u8),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempBasal {
    pub kind: TempBasalKind,
    /// Remaining minutes; zero when none is running
    pub minutes: u16,
}

/// Pump keypad buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Easy = 0x00,
    Esc = 0x01,
    Act = 0x02,
    Up = 0x03,
    Down = 0x04,
}

fn decode_error(message: impl Into<String>) -> PumpLinkError {
    PumpLinkError::Decode(message.into())
}

fn invalid_argument(message: impl Into<String>) -> PumpLinkError {
    PumpLinkError::InvalidArgument(message.into())
}

/// Fail unless the payload holds at least `len` bytes
fn require(response: &Response, len: usize, what: &str) -> Result<()> {
    if response.payload.len() < len {
        return Err(decode_error(format!(
            "{} needs {} bytes, got {}",
            what,
            len,
            response.payload.len()
        )));
    }
    Ok(())
}

/// Start time of a half-hour schedule slot
fn slot_start(slot: u8) -> Result<NaiveTime> {
    if slot >= SLOTS_PER_DAY {
        return Err(decode_error(format!("schedule slot {} past midnight", slot)));
    }
    NaiveTime::from_num_seconds_from_midnight_opt(u32::from(slot) * SLOT_MINUTES * 60, 0)
        .ok_or_else(|| decode_error(format!("schedule slot {}", slot)))
}

/// Schedule entries of `width` bytes; a later entry starting at slot 0 ends
/// the schedule
fn schedule_entries(body: &[u8], width: usize, slot_of: fn(&[u8]) -> u8) -> impl Iterator<Item = &[u8]> {
    body.chunks_exact(width)
        .enumerate()
        .take_while(move |(i, entry)| *i == 0 || slot_of(entry) != 0)
        .map(|(_, entry)| entry)
}

fn strokes_to_units(strokes: u16) -> f64 {
    f64::from(strokes) / STROKES_PER_UNIT
}

fn units_to_strokes(units: f64) -> u16 {
    (units * STROKES_PER_UNIT).round() as u16
}

/// 0x70: `[hour, minute, second, year(2, BE), month, day]`
pub fn decode_time(response: &Response) -> Result<NaiveDateTime> {
    require(response, 7, "pump time")?;
    let p = &response.payload;
    let year = i32::from(u16::from_be_bytes([p[3], p[4]]));

    NaiveDate::from_ymd_opt(year, u32::from(p[5]), u32::from(p[6]))
        .and_then(|date| date.and_hms_opt(u32::from(p[0]), u32::from(p[1]), u32::from(p[2])))
        .ok_or_else(|| decode_error(format!("invalid pump clock {:02X?}", &p[..7])))
}

/// 0x8D: length-prefixed ASCII model number
pub fn decode_model(response: &Response) -> Result<String> {
    require(response, 1, "model")?;
    let len = usize::from(response.payload[0]);
    let model = response
        .payload
        .get(1..1 + len)
        .ok_or_else(|| decode_error(format!("model length {} overruns payload", len)))?;
    Ok(String::from_utf8_lossy(model).into_owned())
}

/// 0x74: ASCII version string, ending at the first unprintable byte
pub fn decode_firmware(response: &Response) -> Result<String> {
    let printable: Vec<u8> = response
        .payload
        .iter()
        .copied()
        .take_while(|b| b.is_ascii_graphic() || *b == b' ')
        .collect();
    if printable.is_empty() {
        return Err(decode_error("empty firmware version"));
    }
    Ok(String::from_utf8_lossy(&printable).trim().to_string())
}

/// 0x72: `[status, volts x 100 (2, BE)]`
pub fn decode_battery(response: &Response) -> Result<BatteryStatus> {
    require(response, 3, "battery")?;
    let p = &response.payload;
    Ok(BatteryStatus {
        low: p[0] != 0,
        volts: f64::from(u16::from_be_bytes([p[1], p[2]])) / 100.0,
    })
}

/// 0x73: remaining insulin in units
///
/// Current pumps send four bytes with strokes in bytes 2..4; older pumps
/// send two bytes at a coarser resolution.
pub fn decode_reservoir(response: &Response) -> Result<f64> {
    let p = &response.payload;
    if p.len() >= 4 {
        Ok(strokes_to_units(u16::from_be_bytes([p[2], p[3]])))
    } else if p.len() >= 2 {
        Ok(f64::from(u16::from_be_bytes([p[0], p[1]])) / LEGACY_STROKES_PER_UNIT)
    } else {
        Err(decode_error(format!("reservoir needs 2 bytes, got {}", p.len())))
    }
}

/// 0x9F: `[units, (slot, low, high)...]`
pub fn decode_bg_targets(response: &Response) -> Result<BgTargets> {
    require(response, 4, "BG targets")?;
    let units = GlucoseUnits::from_byte(response.payload[0])?;

    let targets = schedule_entries(&response.payload[1..], 3, |e| e[0])
        .map(|e| {
            Ok(BgTarget {
                start: slot_start(e[0])?,
                low: units.scale(u16::from(e[1])),
                high: units.scale(u16::from(e[2])),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(BgTargets { units, targets })
}

/// 0x8B: `[units, (slot | value bit 8 << 6, value)...]`
pub fn decode_isf(response: &Response) -> Result<SensitivitySchedule> {
    require(response, 3, "insulin sensitivities")?;
    let units = GlucoseUnits::from_byte(response.payload[0])?;

    let sensitivities = schedule_entries(&response.payload[1..], 2, |e| e[0] & 0x3F)
        .map(|e| {
            let raw = (u16::from(e[0] >> 6) << 8) | u16::from(e[1]);
            Ok(Sensitivity {
                start: slot_start(e[0] & 0x3F)?,
                value: units.scale(raw),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SensitivitySchedule { units, sensitivities })
}

/// 0x8A: `[units, (slot, ratio)...]`; exchanges are stored in tenths
pub fn decode_carb_ratios(response: &Response) -> Result<CarbRatioSchedule> {
    require(response, 3, "carb ratios")?;
    let units = match response.payload[0] {
        1 => CarbUnits::Grams,
        2 => CarbUnits::Exchanges,
        other => return Err(decode_error(format!("unknown carb units 0x{:02X}", other))),
    };

    let ratios = schedule_entries(&response.payload[1..], 2, |e| e[0])
        .map(|e| {
            let ratio = match units {
                CarbUnits::Grams => f64::from(e[1]),
                CarbUnits::Exchanges => f64::from(e[1]) / 10.0,
            };
            Ok(CarbRatio {
                start: slot_start(e[0])?,
                ratio,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CarbRatioSchedule { units, ratios })
}

/// 0x92-0x94: `(rate strokes (2, LE), slot)...`, zero-filled after the last
pub fn decode_basal_profile(response: &Response) -> Result<Vec<BasalSlot>> {
    require(response, 3, "basal profile")?;

    schedule_entries(&response.payload, 3, |e| e[2])
        .map(|e| {
            Ok(BasalSlot {
                start: slot_start(e[2])?,
                rate: strokes_to_units(u16::from_le_bytes([e[0], e[1]])),
            })
        })
        .collect()
}

/// 0x98: `[kind, percent, rate strokes (2, BE), minutes (2, BE)]`
pub fn decode_temp_basal(response: &Response) -> Result<TempBasal> {
    require(response, 6, "temp basal")?;
    let p = &response.payload;
    let kind = match p[0] {
        0 => TempBasalKind::Absolute(strokes_to_units(u16::from_be_bytes([p[2], p[3]]))),
        1 => TempBasalKind::Percent(p[1]),
        other => return Err(decode_error(format!("unknown temp basal kind 0x{:02X}", other))),
    };
    Ok(TempBasal {
        kind,
        minutes: u16::from_be_bytes([p[4], p[5]]),
    })
}

/// 0x9D: `u32` big-endian
pub fn decode_page_count(response: &Response) -> Result<u32> {
    require(response, 4, "history page count")?;
    let p = &response.payload;
    Ok(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
}

/// Acknowledged commands carry nothing back
pub fn decode_ack(_response: &Response) -> Result<()> {
    Ok(())
}

/// Raw payload, for pass-through execution
pub fn decode_raw(response: &Response) -> Result<Vec<u8>> {
    Ok(response.payload.clone())
}

fn half_hours(minutes: u16) -> Result<u8> {
    if minutes == 0 || minutes > MAX_TEMP_BASAL_MINUTES || u32::from(minutes) % SLOT_MINUTES != 0 {
        return Err(invalid_argument(format!(
            "temp basal duration {} min is not a multiple of 30 up to 24 h",
            minutes
        )));
    }
    Ok((u32::from(minutes) / SLOT_MINUTES) as u8)
}

/// 0x5D: `[enable, minutes]`
pub fn encode_power_on(minutes: u8) -> Result<Vec<u8>> {
    if minutes == 0 {
        return Err(invalid_argument("radio session of 0 minutes"));
    }
    Ok(vec![0x01, minutes])
}

/// 0x4C: `[rate strokes (2, BE), half hours]`
pub fn encode_temp_basal(rate: f64, minutes: u16) -> Result<Vec<u8>> {
    if !(0.0..=MAX_TEMP_BASAL_RATE).contains(&rate) {
        return Err(invalid_argument(format!("temp basal rate {} U/h", rate)));
    }
    let [high, low] = units_to_strokes(rate).to_be_bytes();
    Ok(vec![high, low, half_hours(minutes)?])
}

/// 0x69: `[percent, half hours]`
pub fn encode_temp_basal_percent(percent: u8, minutes: u16) -> Result<Vec<u8>> {
    if percent > 200 {
        return Err(invalid_argument(format!("temp basal of {}%", percent)));
    }
    Ok(vec![percent, half_hours(minutes)?])
}

/// 0x4D: `[1]` suspends delivery, `[0]` resumes it
pub fn encode_suspend(suspend: bool) -> Vec<u8> {
    vec![u8::from(suspend)]
}

/// 0x42: `[strokes (2, BE)]`
pub fn encode_bolus(units: f64) -> Result<Vec<u8>> {
    if !(units > 0.0 && units <= MAX_BOLUS_UNITS) {
        return Err(invalid_argument(format!("bolus of {} U", units)));
    }
    Ok(units_to_strokes(units).to_be_bytes().to_vec())
}

/// 0x5B: `[button]`
pub fn encode_button(button: Button) -> Vec<u8> {
    vec![button as u8]
}
