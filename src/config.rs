//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::codec::protocol::PumpSerial;
use crate::error::{PumpLinkError, Result};
use crate::radio::region::Region;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    pub pump: PumpConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub retries: RetryConfig,
}

/// Radio stick link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    /// Explicit device path; empty means discover by USB id
    #[serde(default)]
    pub port: String,

    /// USB `[vendor, product]` pairs tried in order
    #[serde(default = "default_usb_ids")]
    pub usb_ids: Vec<[u16; 2]>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Reply deadline for local stick commands
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Pump identity
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PumpConfig {
    /// Six hex digits from the pump label
    pub serial: String,
}

/// Radio tuning and scan configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    #[serde(default = "default_region")]
    pub region: Region,

    #[serde(default = "default_frequency_mhz")]
    pub frequency_mhz: f64,

    #[serde(default = "default_reference_clock_mhz")]
    pub reference_clock_mhz: f64,

    #[serde(default = "default_rssi_offset_db")]
    pub rssi_offset_db: f64,

    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u32,

    #[serde(default = "default_scan_samples")]
    pub scan_samples: usize,

    #[serde(default = "default_scan_points")]
    pub scan_points: usize,

    #[serde(default = "default_plateau_threshold_db")]
    pub plateau_threshold_db: f64,
}

/// Big-transfer retry budgets
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,

    #[serde(default = "default_nak_retries")]
    pub nak_retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            usb_ids: default_usb_ids(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            frequency_mhz: default_frequency_mhz(),
            reference_clock_mhz: default_reference_clock_mhz(),
            rssi_offset_db: default_rssi_offset_db(),
            listen_timeout_ms: default_listen_timeout_ms(),
            scan_samples: default_scan_samples(),
            scan_points: default_scan_points(),
            plateau_threshold_db: default_plateau_threshold_db(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            init_attempts: default_init_attempts(),
            nak_retries: default_nak_retries(),
        }
    }
}

// Default value functions
fn default_usb_ids() -> Vec<[u16; 2]> { vec![[0x0451, 0x16A7], [0x0A21, 0x8001]] }
fn default_baud_rate() -> u32 { 19200 }
fn default_read_timeout_ms() -> u64 { 500 }

fn default_region() -> Region { Region::NorthAmerica }
fn default_frequency_mhz() -> f64 { 916.5 }
fn default_reference_clock_mhz() -> f64 { 24.0 }
fn default_rssi_offset_db() -> f64 { 73.0 }
fn default_listen_timeout_ms() -> u32 { 250 }
fn default_scan_samples() -> usize { 3 }
fn default_scan_points() -> usize { 25 }
fn default_plateau_threshold_db() -> f64 { 3.0 }

fn default_init_attempts() -> u32 { 3 }
fn default_nak_retries() -> u32 { 2 }

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pumplink::config::Config;
    ///
    /// let config = Config::load("pumplink.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Pump serial as bytes
    pub fn pump_serial(&self) -> Result<PumpSerial> {
        PumpSerial::parse(&self.pump.serial)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        fn invalid(message: impl std::fmt::Display) -> PumpLinkError {
            PumpLinkError::Config(toml::de::Error::custom(message))
        }

        if self.pump_serial().is_err() {
            return Err(invalid("pump serial must be exactly 6 hex digits"));
        }

        if self.link.port.is_empty() && self.link.usb_ids.is_empty() {
            return Err(invalid("either link.port or link.usb_ids must be set"));
        }

        if self.link.read_timeout_ms == 0 || self.link.read_timeout_ms > 10000 {
            return Err(invalid("read_timeout_ms must be between 1 and 10000"));
        }

        if self.radio.listen_timeout_ms == 0 || self.radio.listen_timeout_ms > 10000 {
            return Err(invalid("listen_timeout_ms must be between 1 and 10000"));
        }

        if !self.radio.region.contains(self.radio.frequency_mhz) {
            return Err(invalid(format!(
                "frequency_mhz {} is outside the {:?} band ({:.3}-{:.3} MHz)",
                self.radio.frequency_mhz,
                self.radio.region,
                self.radio.region.low_mhz(),
                self.radio.region.high_mhz()
            )));
        }

        if self.radio.reference_clock_mhz <= 0.0 {
            return Err(invalid("reference_clock_mhz must be positive"));
        }

        if self.radio.scan_samples == 0 || self.radio.scan_samples > 20 {
            return Err(invalid("scan_samples must be between 1 and 20"));
        }

        if self.radio.scan_points < 2 || self.radio.scan_points > 200 {
            return Err(invalid("scan_points must be between 2 and 200"));
        }

        if self.radio.plateau_threshold_db < 0.0 || self.radio.plateau_threshold_db > 20.0 {
            return Err(invalid("plateau_threshold_db must be between 0.0 and 20.0"));
        }

        if self.retries.init_attempts == 0 || self.retries.init_attempts > 50 {
            return Err(invalid("init_attempts must be between 1 and 50"));
        }

        if self.retries.nak_retries > 10 {
            return Err(invalid("nak_retries must be at most 10"));
        }

        Ok(())
    }
}
