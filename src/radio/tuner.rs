//! # Radio Tuner
//!
//! Frequency synthesis and band scanning.
//!
//! The radio chip derives its carrier from three 8-bit registers forming a
//! 24-bit word: `word = round(f * 2^16 / f_ref)`. Every register write is read
//! back; the chip silently ignores writes in some states, so an unverified
//! tune cannot be trusted.

use async_trait::async_trait;
use tracing::{debug, info, trace};

use super::region::Region;
use crate::config::RadioConfig;
use crate::error::{Result, TuningError};
use crate::link::port_trait::LinkIo;
use crate::link::rssi::RSSI_SENTINEL_DBM;
use crate::link::RadioStick;

/// Frequency word, high byte
pub const FREQ2: u8 = 0x09;
/// Frequency word, middle byte
pub const FREQ1: u8 = 0x0A;
/// Frequency word, low byte
pub const FREQ0: u8 = 0x0B;

pub const DEFAULT_REFERENCE_CLOCK_MHZ: f64 = 24.0;

/// Largest value the three frequency registers can hold
const MAX_FREQUENCY_WORD: f64 = 0x00FF_FFFF as f64;

/// Register access to the radio chip
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisterBus: Send {
    async fn write_register(&mut self, register: u8, value: u8) -> Result<()>;
    async fn read_register(&mut self, register: u8) -> Result<u8>;
}

#[async_trait]
impl<P: LinkIo> RegisterBus for RadioStick<P> {
    async fn write_register(&mut self, register: u8, value: u8) -> Result<()> {
        self.update_register(register, value).await
    }

    async fn read_register(&mut self, register: u8) -> Result<u8> {
        RadioStick::read_register(self, register).await
    }
}

/// A lightweight exchange whose only interesting result is signal strength
#[async_trait]
pub trait RssiProbe<B: ?Sized + Send>: Sync {
    /// Signal strength of one answered probe, in dBm
    async fn probe(&self, bus: &mut B) -> Result<i16>;
}

/// Scan shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSettings {
    /// Probes per candidate frequency
    pub samples: usize,
    /// Evenly spaced candidate frequencies, edges included
    pub points: usize,
    /// Width of the plateau below the strongest average, in dB
    pub plateau_threshold_db: f64,
}

impl From<&RadioConfig> for ScanSettings {
    fn from(config: &RadioConfig) -> Self {
        Self {
            samples: config.scan_samples,
            points: config.scan_points,
            plateau_threshold_db: config.plateau_threshold_db,
        }
    }
}

/// Averaged signal strength at one candidate frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPoint {
    pub frequency_mhz: f64,
    pub average_dbm: f64,
    /// Probes that were answered
    pub responses: usize,
}

/// Contiguous run of scan points close to the strongest one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plateau {
    pub first: usize,
    pub last: usize,
    /// Midpoint of the run's edge frequencies
    pub frequency_mhz: f64,
}

impl Plateau {
    pub fn width(&self) -> usize {
        self.last - self.first + 1
    }
}

/// Result of a band scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub region: Region,
    pub points: Vec<ScanPoint>,
    pub plateau: Plateau,
}

impl ScanReport {
    /// The frequency the scan settled on
    pub fn selected_mhz(&self) -> f64 {
        self.plateau.frequency_mhz
    }

    /// Strongest average seen
    pub fn peak_dbm(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.average_dbm)
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// 24-bit synthesizer word for a carrier frequency
///
/// # Examples
///
/// ```
/// use pumplink::radio::tuner::frequency_word;
///
/// assert_eq!(frequency_word(916.5, 24.0), 0x26_3000);
/// ```
pub fn frequency_word(mhz: f64, reference_clock_mhz: f64) -> u32 {
    (mhz * 65536.0 / reference_clock_mhz).round() as u32
}

/// Carrier frequency produced by a synthesizer word
pub fn word_to_mhz(word: u32, reference_clock_mhz: f64) -> f64 {
    f64::from(word) * reference_clock_mhz / 65536.0
}

/// Register writes for a word, most significant byte first
pub fn register_values(word: u32) -> [(u8, u8); 3] {
    let [_, high, middle, low] = word.to_be_bytes();
    [(FREQ2, high), (FREQ1, middle), (FREQ0, low)]
}

/// Pick the frequency from averaged scan points
///
/// Points where no probe was answered are ignored, however their average
/// reads. Among the remaining points, the widest contiguous run within `threshold_db` of the
/// strongest average wins; ties go to the run holding the strongest point,
/// then to the lowest frequency. Returns `None` when every point failed.
pub fn select_frequency(points: &[ScanPoint], threshold_db: f64) -> Option<Plateau> {
    let answered = |p: &ScanPoint| p.responses > 0;

    let peak = points
        .iter()
        .filter(|p| answered(p))
        .map(|p| p.average_dbm)
        .fold(f64::NEG_INFINITY, f64::max);
    if peak == f64::NEG_INFINITY {
        return None;
    }

    let near_peak = |p: &ScanPoint| answered(p) && p.average_dbm >= peak - threshold_db;

    let mut best: Option<(usize, usize, bool)> = None;
    let mut start = None;
    for i in 0..=points.len() {
        match (start, points.get(i).is_some_and(|p| near_peak(p))) {
            (None, true) => start = Some(i),
            (Some(first), false) => {
                let last = i - 1;
                let holds_peak = points[first..=last].iter().any(|p| p.average_dbm == peak);
                let better = match best {
                    None => true,
                    Some((b_first, b_last, b_peak)) => {
                        let (width, b_width) = (last - first, b_last - b_first);
                        width > b_width || (width == b_width && holds_peak && !b_peak)
                    }
                };
                if better {
                    best = Some((first, last, holds_peak));
                }
                start = None;
            }
            _ => {}
        }
    }

    best.map(|(first, last, _)| Plateau {
        first,
        last,
        frequency_mhz: (points[first].frequency_mhz + points[last].frequency_mhz) / 2.0,
    })
}

/// Frequency synthesis and scan over a [`RegisterBus`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioTuner {
    reference_clock_mhz: f64,
}

impl Default for RadioTuner {
    fn default() -> Self {
        Self::new(DEFAULT_REFERENCE_CLOCK_MHZ)
    }
}

impl RadioTuner {
    pub fn new(reference_clock_mhz: f64) -> Self {
        Self { reference_clock_mhz }
    }

    /// Size of one synthesizer step in MHz
    pub fn resolution_mhz(&self) -> f64 {
        word_to_mhz(1, self.reference_clock_mhz)
    }

    /// Tune the radio, verifying every register by read-back
    ///
    /// # Returns
    ///
    /// * The frequency actually synthesized (within half a step of `mhz`)
    ///
    /// # Errors
    ///
    /// - [`TuningError::RegisterWriteFailed`] if a register reads back a
    ///   different value
    /// - [`TuningError::UnknownFrequencyRange`] if `mhz` cannot be synthesized
    pub async fn tune<B: RegisterBus + ?Sized>(&self, bus: &mut B, mhz: f64) -> Result<f64> {
        let raw = mhz * 65536.0 / self.reference_clock_mhz;
        if !raw.is_finite() || raw < 0.0 || raw.round() > MAX_FREQUENCY_WORD {
            return Err(TuningError::UnknownFrequencyRange { low: mhz, high: mhz }.into());
        }

        let word = frequency_word(mhz, self.reference_clock_mhz);
        for (register, value) in register_values(word) {
            bus.write_register(register, value).await?;
            let read = bus.read_register(register).await?;
            if read != value {
                return Err(TuningError::RegisterWriteFailed {
                    register,
                    wrote: value,
                    read,
                }
                .into());
            }
        }

        let actual = word_to_mhz(word, self.reference_clock_mhz);
        debug!("Tuned to {:.4} MHz (word 0x{:06X})", actual, word);
        Ok(actual)
    }

    /// Frequency the radio is currently tuned to
    pub async fn read_frequency<B: RegisterBus + ?Sized>(&self, bus: &mut B) -> Result<f64> {
        let high = bus.read_register(FREQ2).await?;
        let middle = bus.read_register(FREQ1).await?;
        let low = bus.read_register(FREQ0).await?;
        let word = u32::from_be_bytes([0, high, middle, low]);
        Ok(word_to_mhz(word, self.reference_clock_mhz))
    }

    /// Scan a whole regional band
    pub async fn scan_region<B, Q>(&self, bus: &mut B, probe: &Q, region: Region, settings: &ScanSettings) -> Result<ScanReport>
    where
        B: RegisterBus + ?Sized,
        Q: RssiProbe<B> + ?Sized,
    {
        self.scan(bus, probe, region.low_mhz(), region.high_mhz(), settings)
            .await
    }

    /// Sample signal strength across `low_mhz..=high_mhz` and pick a channel
    ///
    /// Each candidate is tuned, probed `settings.samples` times, and averaged.
    /// A probe that fails counts as [`RSSI_SENTINEL_DBM`]. The radio is left
    /// tuned to the last candidate; retuning to the result is the caller's
    /// decision.
    ///
    /// # Errors
    ///
    /// - [`TuningError::UnknownFrequencyRange`] if the bounds leave every band
    /// - [`TuningError::InvalidScan`] for fewer than 2 points or 0 samples
    /// - [`TuningError::NoDeviceFound`] if no probe was answered anywhere
    /// - Tuning failures abort the scan
    pub async fn scan<B, Q>(
        &self,
        bus: &mut B,
        probe: &Q,
        low_mhz: f64,
        high_mhz: f64,
        settings: &ScanSettings,
    ) -> Result<ScanReport>
    where
        B: RegisterBus + ?Sized,
        Q: RssiProbe<B> + ?Sized,
    {
        let region = Region::for_range(low_mhz, high_mhz)?;
        if settings.points < 2 {
            return Err(TuningError::InvalidScan(format!("{} scan points", settings.points)).into());
        }
        if settings.samples == 0 {
            return Err(TuningError::InvalidScan("0 samples per point".to_string()).into());
        }

        info!(
            "Scanning {} band {:.3}-{:.3} MHz ({} points x {} samples)",
            region, low_mhz, high_mhz, settings.points, settings.samples
        );

        let step = (high_mhz - low_mhz) / (settings.points - 1) as f64;
        let mut points = Vec::with_capacity(settings.points);

        for i in 0..settings.points {
            let frequency_mhz = low_mhz + step * i as f64;
            self.tune(bus, frequency_mhz).await?;

            let mut total = 0.0;
            let mut responses = 0;
            for _ in 0..settings.samples {
                match probe.probe(bus).await {
                    Ok(dbm) => {
                        total += f64::from(dbm);
                        responses += 1;
                    }
                    Err(e) => {
                        trace!("Probe at {:.3} MHz failed: {}", frequency_mhz, e);
                        total += f64::from(RSSI_SENTINEL_DBM);
                    }
                }
            }

            let average_dbm = total / settings.samples as f64;
            debug!(
                "{:.3} MHz: {:.1} dBm ({}/{} answered)",
                frequency_mhz, average_dbm, responses, settings.samples
            );
            points.push(ScanPoint {
                frequency_mhz,
                average_dbm,
                responses,
            });
        }

        let plateau = select_frequency(&points, settings.plateau_threshold_db).ok_or(TuningError::NoDeviceFound)?;
        info!(
            "Selected {:.3} MHz (plateau of {} points)",
            plateau.frequency_mhz,
            plateau.width()
        );

        Ok(ScanReport {
            region,
            points,
            plateau,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PumpLinkError, RadioStatus};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Radio whose registers hold whatever was last written
    struct FakeRadio {
        registers: [u8; 3],
    }

    impl FakeRadio {
        fn new() -> Self {
            Self { registers: [0; 3] }
        }

        fn frequency(&self) -> f64 {
            let [high, middle, low] = self.registers;
            word_to_mhz(u32::from_be_bytes([0, high, middle, low]), DEFAULT_REFERENCE_CLOCK_MHZ)
        }
    }

    #[async_trait]
    impl RegisterBus for FakeRadio {
        async fn write_register(&mut self, register: u8, value: u8) -> Result<()> {
            self.registers[usize::from(register - FREQ2)] = value;
            Ok(())
        }

        async fn read_register(&mut self, register: u8) -> Result<u8> {
            Ok(self.registers[usize::from(register - FREQ2)])
        }
    }

    /// Pump answering with a clean peak; silent further than `reach_mhz` away
    struct PeakProbe {
        center_mhz: f64,
        reach_mhz: f64,
    }

    #[async_trait]
    impl RssiProbe<FakeRadio> for PeakProbe {
        async fn probe(&self, bus: &mut FakeRadio) -> Result<i16> {
            let offset = (bus.frequency() - self.center_mhz).abs();
            if offset > self.reach_mhz {
                return Err(RadioStatus::Timeout.into());
            }
            Ok((-40.0 - 200.0 * offset).round() as i16)
        }
    }

    fn point(frequency_mhz: f64, average_dbm: f64) -> ScanPoint {
        ScanPoint {
            frequency_mhz,
            average_dbm,
            responses: 1,
        }
    }

    /// Point where every probe failed
    fn silent(frequency_mhz: f64) -> ScanPoint {
        ScanPoint {
            frequency_mhz,
            average_dbm: f64::from(RSSI_SENTINEL_DBM),
            responses: 0,
        }
    }

    /// Pump heard across the whole band, faintly; every `fail_every`th
    /// sample is lost (0: none)
    struct FaintPump {
        center_mhz: f64,
        fail_every: usize,
        calls: AtomicUsize,
    }

    impl FaintPump {
        fn new(center_mhz: f64, fail_every: usize) -> Self {
            Self {
                center_mhz,
                fail_every,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RssiProbe<FakeRadio> for FaintPump {
        async fn probe(&self, bus: &mut FakeRadio) -> Result<i16> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            if self.fail_every > 0 && call % self.fail_every == 0 {
                return Err(RadioStatus::NoData.into());
            }
            let offset = (bus.frequency() - self.center_mhz).abs();
            Ok((-100.0 - 40.0 * offset).round() as i16)
        }
    }

    fn settings() -> ScanSettings {
        ScanSettings {
            samples: 3,
            points: 25,
            plateau_threshold_db: 3.0,
        }
    }

    #[test]
    fn test_frequency_word() {
        assert_eq!(frequency_word(916.5, 24.0), 0x26_3000);
        assert_eq!(register_values(0x26_3000), [(FREQ2, 0x26), (FREQ1, 0x30), (FREQ0, 0x00)]);
    }

    #[test]
    fn test_word_round_trip_within_one_step() {
        let tuner = RadioTuner::default();
        for region in Region::ALL {
            let mut mhz = region.low_mhz();
            while mhz <= region.high_mhz() {
                let back = word_to_mhz(frequency_word(mhz, 24.0), 24.0);
                assert!((back - mhz).abs() <= tuner.resolution_mhz());
                mhz += 0.0137;
            }
        }
    }

    #[tokio::test]
    async fn test_tune_writes_and_verifies_each_register() {
        let mut bus = MockRegisterBus::new();
        let mut seq = Sequence::new();
        for (register, value) in [(FREQ2, 0x26), (FREQ1, 0x30), (FREQ0, 0x00)] {
            bus.expect_write_register()
                .with(eq(register), eq(value))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
            bus.expect_read_register()
                .with(eq(register))
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(value));
        }

        let actual = RadioTuner::default().tune(&mut bus, 916.5).await.unwrap();
        assert!((actual - 916.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_tune_read_back_mismatch() {
        let mut bus = MockRegisterBus::new();
        bus.expect_write_register().returning(|_, _| Ok(()));
        bus.expect_read_register().with(eq(FREQ2)).returning(|_| Ok(0x26));
        bus.expect_read_register().with(eq(FREQ1)).returning(|_| Ok(0x31));

        let err = RadioTuner::default().tune(&mut bus, 916.5).await.unwrap_err();
        match err {
            PumpLinkError::Tuning(TuningError::RegisterWriteFailed { register, wrote, read }) => {
                assert_eq!((register, wrote, read), (FREQ1, 0x30, 0x31));
            }
            other => panic!("Expected RegisterWriteFailed, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tune_rejects_unrepresentable_frequency() {
        let mut bus = MockRegisterBus::new();
        let tuner = RadioTuner::default();

        assert!(tuner.tune(&mut bus, -1.0).await.is_err());
        assert!(tuner.tune(&mut bus, f64::NAN).await.is_err());
        assert!(tuner.tune(&mut bus, 9000.0).await.is_err());
    }

    #[tokio::test]
    async fn test_tune_then_read_back_reconstructs_frequency() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();

        for region in Region::ALL {
            let mut mhz = region.low_mhz();
            while mhz <= region.high_mhz() {
                tuner.tune(&mut radio, mhz).await.unwrap();
                let back = tuner.read_frequency(&mut radio).await.unwrap();
                assert!((back - mhz).abs() <= tuner.resolution_mhz());
                mhz += 0.05;
            }
        }
    }

    #[test]
    fn test_select_single_peak() {
        let points: Vec<_> = [-90.0, -70.0, -50.0, -70.0, -90.0]
            .iter()
            .enumerate()
            .map(|(i, &dbm)| point(916.3 + 0.1 * i as f64, dbm))
            .collect();

        let plateau = select_frequency(&points, 3.0).unwrap();
        assert_eq!((plateau.first, plateau.last), (2, 2));
        assert!((plateau.frequency_mhz - 916.5).abs() < 1e-9);
    }

    #[test]
    fn test_select_prefers_wide_plateau_over_edge_spike() {
        let points: Vec<_> = [-90.0, -80.0, -81.0, -80.5, -81.0, -90.0, -78.0]
            .iter()
            .enumerate()
            .map(|(i, &dbm)| point(916.3 + 0.1 * i as f64, dbm))
            .collect();

        let plateau = select_frequency(&points, 3.0).unwrap();
        assert_eq!((plateau.first, plateau.last), (1, 4));
        assert!((plateau.frequency_mhz - 916.55).abs() < 1e-9);
    }

    #[test]
    fn test_select_ignores_sentinel_points() {
        let points = vec![silent(916.3), point(916.4, -97.0), silent(916.5)];

        let plateau = select_frequency(&points, 3.0).unwrap();
        assert_eq!((plateau.first, plateau.last), (1, 1));
    }

    #[test]
    fn test_select_all_sentinel() {
        let points = vec![silent(916.3), silent(916.4)];
        assert_eq!(select_frequency(&points, 3.0), None);
        assert_eq!(select_frequency(&[], 3.0), None);
    }

    #[test]
    fn test_select_weak_but_answering_points() {
        let points: Vec<_> = (0..5)
            .map(|i| ScanPoint {
                frequency_mhz: 916.3 + 0.15 * i as f64,
                average_dbm: -105.0,
                responses: 3,
            })
            .collect();

        let plateau = select_frequency(&points, 3.0).unwrap();
        assert_eq!((plateau.first, plateau.last), (0, 4));
        assert!((plateau.frequency_mhz - 916.6).abs() < 1e-9);
    }

    #[test]
    fn test_select_tie_goes_to_run_with_peak() {
        let points: Vec<_> = [-81.0, -90.0, -80.0]
            .iter()
            .enumerate()
            .map(|(i, &dbm)| point(916.3 + 0.1 * i as f64, dbm))
            .collect();

        let plateau = select_frequency(&points, 3.0).unwrap();
        assert_eq!(plateau.first, 2);
    }

    #[tokio::test]
    async fn test_scan_finds_unimodal_peak() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();
        let probe = PeakProbe {
            center_mhz: 916.55,
            reach_mhz: 0.2,
        };

        let report = tuner
            .scan_region(&mut radio, &probe, Region::NorthAmerica, &settings())
            .await
            .unwrap();

        assert_eq!(report.points.len(), 25);
        assert!((report.selected_mhz() - 916.55).abs() <= 0.025 + 1e-9);
        assert!(report.peak_dbm() > -41.0);
    }

    #[tokio::test]
    async fn test_scan_failed_probes_count_as_sentinel() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();
        let probe = PeakProbe {
            center_mhz: 916.55,
            reach_mhz: 0.05,
        };

        let report = tuner
            .scan_region(&mut radio, &probe, Region::NorthAmerica, &settings())
            .await
            .unwrap();

        let edge = report.points[0];
        assert_eq!(edge.responses, 0);
        assert_eq!(edge.average_dbm, f64::from(RSSI_SENTINEL_DBM));
    }

    #[tokio::test]
    async fn test_scan_finds_faint_pump() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();
        let pump = FaintPump::new(916.6, 0);

        let report = tuner
            .scan_region(&mut radio, &pump, Region::NorthAmerica, &settings())
            .await
            .unwrap();

        assert!(report.points.iter().all(|p| p.responses == 3));
        assert!((report.selected_mhz() - 916.6).abs() < 1e-6);
        assert!((report.peak_dbm() + 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scan_with_some_samples_lost() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();
        let pump = FaintPump::new(916.6, 3);

        let report = tuner
            .scan_region(&mut radio, &pump, Region::NorthAmerica, &settings())
            .await
            .unwrap();

        assert!(report.points.iter().all(|p| p.responses == 2));
        assert!((report.selected_mhz() - 916.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_scan_with_no_pump() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();
        let probe = PeakProbe {
            center_mhz: 868.35,
            reach_mhz: 0.1,
        };

        let err = tuner
            .scan_region(&mut radio, &probe, Region::NorthAmerica, &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, PumpLinkError::Tuning(TuningError::NoDeviceFound)));
    }

    #[tokio::test]
    async fn test_scan_outside_every_region() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();
        let probe = PeakProbe {
            center_mhz: 916.55,
            reach_mhz: 0.1,
        };

        let err = tuner
            .scan(&mut radio, &probe, 900.0, 916.5, &settings())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PumpLinkError::Tuning(TuningError::UnknownFrequencyRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_scan_rejects_degenerate_settings() {
        let tuner = RadioTuner::default();
        let mut radio = FakeRadio::new();
        let probe = PeakProbe {
            center_mhz: 916.55,
            reach_mhz: 0.1,
        };

        let mut bad = settings();
        bad.points = 1;
        let err = tuner
            .scan_region(&mut radio, &probe, Region::NorthAmerica, &bad)
            .await
            .unwrap_err();
        assert!(matches!(err, PumpLinkError::Tuning(TuningError::InvalidScan(_))));
    }
}
