//! RSSI conversion for the radio stick's link header.

/// Calibration offset of the stick's radio chip in dB
pub const DEFAULT_RSSI_OFFSET_DB: f64 = 73.0;

/// Stand-in signal strength for a probe that failed, below any reading at
/// the default offset
pub const RSSI_SENTINEL_DBM: i16 = -150;

/// Convert a raw RSSI byte to dBm
///
/// The chip reports half-dB steps as a two's complement byte.
///
/// # Examples
///
/// ```
/// use pumplink::link::rssi::rssi_to_dbm;
///
/// assert_eq!(rssi_to_dbm(0x00, 73.0), -73);
/// assert_eq!(rssi_to_dbm(0xD0, 73.0), -97);
/// ```
pub fn rssi_to_dbm(raw: u8, offset_db: f64) -> i16 {
    let half_db = if raw >= 128 {
        f64::from(raw) - 256.0
    } else {
        f64::from(raw)
    };

    (half_db / 2.0 - offset_db).round() as i16
}
