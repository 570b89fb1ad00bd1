//! # Pump Session
//!
//! [`Pump`] ties the layers together for one pump: it owns the radio stick,
//! keeps it tuned, and runs catalogued commands through the
//! [`CommandEngine`].
//!
//! ```text
//! Pump::open ──> LinkTransport ──> RadioStick (state, version) ──> tune
//!   read_model / set_temp_basal / read_history_page ...
//!     └─> CommandEngine ──> PacketCodec ──> SymbolCodec ──> stick
//! ```

pub mod catalogue;
pub mod decode;
pub mod history;

use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::command::{CommandEngine, CommandSpec, EngineProbe, Query, Response};
use crate::config::{Config, RadioConfig};
use crate::error::{ProtocolError, PumpLinkError, Result, TransportError};
use crate::link::port_trait::{LinkIo, TokioSerialPort};
use crate::link::{LinkTransport, RadioStick};
use crate::radio::{RadioTuner, ScanReport, ScanSettings};

use decode::{
    BasalProfile, BasalSlot, BatteryStatus, BgTargets, Button, CarbRatioSchedule, SensitivitySchedule, TempBasal,
};
use history::{CgmPage, HistoryPage};

/// An open session with one pump through one radio stick
pub struct Pump<P: LinkIo = TokioSerialPort> {
    stick: RadioStick<P>,
    engine: CommandEngine,
    tuner: RadioTuner,
    radio: RadioConfig,
    frequency_mhz: f64,
}

impl<P: LinkIo> std::fmt::Debug for Pump<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("device", &self.stick.device_path())
            .field("serial", &self.engine.serial())
            .field("frequency_mhz", &self.frequency_mhz)
            .finish()
    }
}

impl Pump<TokioSerialPort> {
    /// Open the configured radio stick and prepare it for this pump
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No stick is found or it cannot be opened
    /// - The stick firmware does not report ready
    /// - The configured frequency cannot be tuned
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pumplink::config::Config;
    /// use pumplink::pump::Pump;
    ///
    /// # async fn run() -> anyhow::Result<()> {
    /// let config = Config::load("pumplink.toml")?;
    /// let mut pump = Pump::open(&config).await?;
    /// println!("model {}", pump.read_model().await?);
    /// pump.close();
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(config: &Config) -> Result<Self> {
        let link = LinkTransport::open(&config.link)?;
        Self::with_link(link, config).await
    }
}

impl<P: LinkIo> Pump<P> {
    /// Start a session over an already open transport
    pub async fn with_link(link: LinkTransport<P>, config: &Config) -> Result<Self> {
        let serial = config.pump_serial()?;
        let mut stick = RadioStick::new(link, config.radio.rssi_offset_db)
            .with_command_timeout(Duration::from_millis(config.link.read_timeout_ms));

        if !stick.get_state().await? {
            return Err(TransportError::Open {
                path: stick.device_path().to_string(),
                reason: "radio firmware is not ready".to_string(),
            }
            .into());
        }
        let version = stick.get_version().await?;
        info!("Radio stick on {}: {}", stick.device_path(), version);

        let tuner = RadioTuner::new(config.radio.reference_clock_mhz);
        let frequency_mhz = tuner.tune(&mut stick, config.radio.frequency_mhz).await?;

        let engine = CommandEngine::new(serial)
            .with_listen_timeout(config.radio.listen_timeout_ms)
            .with_retries(&config.retries);

        info!("Session with pump {} at {:.3} MHz", serial, frequency_mhz);
        Ok(Self {
            stick,
            engine,
            tuner,
            radio: config.radio.clone(),
            frequency_mhz,
        })
    }

    /// End the session and release the stick
    pub fn close(self) {
        info!("Closing session on {}", self.stick.device_path());
    }

    /// Frequency the radio is tuned to
    pub fn frequency_mhz(&self) -> f64 {
        self.frequency_mhz
    }

    /// Retune the radio
    pub async fn tune(&mut self, mhz: f64) -> Result<f64> {
        self.frequency_mhz = self.tuner.tune(&mut self.stick, mhz).await?;
        Ok(self.frequency_mhz)
    }

    /// Scan the configured region for the pump and retune to the best channel
    ///
    /// On failure the radio goes back to the frequency it had before.
    pub async fn optimize_frequency(&mut self) -> Result<ScanReport> {
        let settings = ScanSettings::from(&self.radio);
        let probe = EngineProbe {
            engine: &self.engine,
            spec: catalogue::READ_MODEL,
        };

        let scanned = self
            .tuner
            .scan_region(&mut self.stick, &probe, self.radio.region, &settings)
            .await;
        let report = match scanned {
            Ok(report) => report,
            Err(e) => {
                if let Err(restore) = self.tuner.tune(&mut self.stick, self.frequency_mhz).await {
                    warn!("Could not restore {:.3} MHz after failed scan: {}", self.frequency_mhz, restore);
                }
                return Err(e);
            }
        };

        self.frequency_mhz = self.tuner.tune(&mut self.stick, report.selected_mhz()).await?;
        info!(
            "Pump heard best at {:.3} MHz (peak {:.1} dBm)",
            self.frequency_mhz,
            report.peak_dbm()
        );
        Ok(report)
    }

    /// Run any command the engine understands
    pub async fn execute<C>(&mut self, command: &C) -> Result<C::Output>
    where
        C: crate::command::PumpCommand + ?Sized,
    {
        self.engine.execute(&mut self.stick, command).await
    }

    /// Run a catalogued opcode with a caller-built payload
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnsupportedOpcode`] if the opcode is not catalogued,
    /// so its response shape is unknown
    pub async fn execute_raw(&mut self, opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let spec = catalogue::lookup(opcode).ok_or(ProtocolError::UnsupportedOpcode(opcode))?;
        let response = self.engine.exchange(&mut self.stick, &spec, payload).await?;
        Ok(response.payload)
    }

    async fn query<T>(&mut self, spec: CommandSpec, payload: Vec<u8>, decode: fn(&Response) -> Result<T>) -> Result<T> {
        let query = Query::new(spec, decode).with_payload(payload);
        self.engine.execute(&mut self.stick, &query).await
    }

    /// Wake the pump's radio for `minutes`
    pub async fn power_on(&mut self, minutes: u8) -> Result<()> {
        let payload = decode::encode_power_on(minutes)?;
        self.query(catalogue::POWER_ON, payload, decode::decode_ack).await
    }

    pub async fn read_model(&mut self) -> Result<String> {
        self.query(catalogue::READ_MODEL, Vec::new(), decode::decode_model).await
    }

    pub async fn read_firmware(&mut self) -> Result<String> {
        self.query(catalogue::READ_FIRMWARE, Vec::new(), decode::decode_firmware).await
    }

    /// Pump clock, local time as set on the pump
    pub async fn read_time(&mut self) -> Result<NaiveDateTime> {
        self.query(catalogue::READ_TIME, Vec::new(), decode::decode_time).await
    }

    pub async fn read_battery(&mut self) -> Result<BatteryStatus> {
        self.query(catalogue::READ_BATTERY, Vec::new(), decode::decode_battery).await
    }

    /// Insulin left in the reservoir, in units
    pub async fn read_reservoir(&mut self) -> Result<f64> {
        self.query(catalogue::READ_RESERVOIR, Vec::new(), decode::decode_reservoir).await
    }

    pub async fn read_bg_targets(&mut self) -> Result<BgTargets> {
        self.query(catalogue::READ_BG_TARGETS, Vec::new(), decode::decode_bg_targets).await
    }

    pub async fn read_isf(&mut self) -> Result<SensitivitySchedule> {
        self.query(catalogue::READ_ISF, Vec::new(), decode::decode_isf).await
    }

    pub async fn read_carb_ratios(&mut self) -> Result<CarbRatioSchedule> {
        self.query(catalogue::READ_CARB_RATIOS, Vec::new(), decode::decode_carb_ratios).await
    }

    pub async fn read_basal_profile(&mut self, profile: BasalProfile) -> Result<Vec<BasalSlot>> {
        self.query(catalogue::basal_profile(profile), Vec::new(), decode::decode_basal_profile)
            .await
    }

    pub async fn read_temp_basal(&mut self) -> Result<TempBasal> {
        self.query(catalogue::READ_TEMP_BASAL, Vec::new(), decode::decode_temp_basal).await
    }

    /// Set an absolute temp basal of `rate` U/h
    pub async fn set_temp_basal(&mut self, rate: f64, minutes: u16) -> Result<()> {
        let payload = decode::encode_temp_basal(rate, minutes)?;
        info!("Setting temp basal {:.3} U/h for {} min", rate, minutes);
        self.query(catalogue::SET_TEMP_BASAL, payload, decode::decode_ack).await
    }

    pub async fn set_temp_basal_percent(&mut self, percent: u8, minutes: u16) -> Result<()> {
        let payload = decode::encode_temp_basal_percent(percent, minutes)?;
        info!("Setting temp basal {}% for {} min", percent, minutes);
        self.query(catalogue::SET_TEMP_BASAL_PERCENT, payload, decode::decode_ack)
            .await
    }

    pub async fn suspend(&mut self) -> Result<()> {
        info!("Suspending delivery");
        self.query(catalogue::SET_SUSPEND, decode::encode_suspend(true), decode::decode_ack)
            .await
    }

    pub async fn resume(&mut self) -> Result<()> {
        info!("Resuming delivery");
        self.query(catalogue::SET_SUSPEND, decode::encode_suspend(false), decode::decode_ack)
            .await
    }

    pub async fn deliver_bolus(&mut self, units: f64) -> Result<()> {
        let payload = decode::encode_bolus(units)?;
        info!("Delivering bolus of {:.3} U", units);
        self.query(catalogue::DELIVER_BOLUS, payload, decode::decode_ack).await
    }

    pub async fn push_button(&mut self, button: Button) -> Result<()> {
        self.query(catalogue::PUSH_BUTTON, decode::encode_button(button), decode::decode_ack)
            .await
    }

    /// Number of history pages the pump holds
    pub async fn read_history_page_count(&mut self) -> Result<u32> {
        self.query(catalogue::READ_HISTORY_PAGE_COUNT, Vec::new(), decode::decode_page_count)
            .await
    }

    /// Read and verify one 1024-byte history page; page 0 is the newest
    pub async fn read_history_page(&mut self, page: u32) -> Result<HistoryPage> {
        let index = u8::try_from(page)
            .map_err(|_| PumpLinkError::InvalidArgument(format!("history page {} out of range", page)))?;
        let data = self
            .query(catalogue::READ_HISTORY_PAGE, vec![index], decode::decode_raw)
            .await?;
        HistoryPage::parse(&data)
    }

    /// Read and verify one sensor (CGM) page
    pub async fn read_cgm_page(&mut self, page: u32) -> Result<CgmPage> {
        let data = self
            .query(catalogue::READ_CGM_PAGE, page.to_be_bytes().to_vec(), decode::decode_raw)
            .await?;
        CgmPage::parse(&data)
    }
}
