//! Legal pump frequency bands.

use serde::Deserialize;

use crate::error::TuningError;

/// Regional pump radio band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    /// US/Canada pumps, around 916.5 MHz
    NorthAmerica,
    /// Pumps sold elsewhere, around 868.35 MHz
    Worldwide,
}

impl Region {
    pub const ALL: [Region; 2] = [Region::NorthAmerica, Region::Worldwide];

    /// Lower band edge in MHz
    pub fn low_mhz(self) -> f64 {
        match self {
            Region::NorthAmerica => 916.300,
            Region::Worldwide => 868.150,
        }
    }

    /// Upper band edge in MHz
    pub fn high_mhz(self) -> f64 {
        match self {
            Region::NorthAmerica => 916.900,
            Region::Worldwide => 868.750,
        }
    }

    /// Band centre, the usual factory frequency
    pub fn center_mhz(self) -> f64 {
        (self.low_mhz() + self.high_mhz()) / 2.0
    }

    /// Whether `mhz` lies inside the band (edges included)
    pub fn contains(self, mhz: f64) -> bool {
        mhz >= self.low_mhz() && mhz <= self.high_mhz()
    }

    /// Find the band containing the whole `low..=high` range
    ///
    /// # Errors
    ///
    /// [`TuningError::UnknownFrequencyRange`] if no single band covers it
    ///
    /// # Examples
    ///
    /// ```
    /// use pumplink::radio::region::Region;
    ///
    /// assert_eq!(Region::for_range(916.4, 916.6).unwrap(), Region::NorthAmerica);
    /// assert!(Region::for_range(868.4, 916.6).is_err());
    /// ```
    pub fn for_range(low: f64, high: f64) -> Result<Region, TuningError> {
        Region::ALL
            .into_iter()
            .find(|region| low <= high && region.contains(low) && region.contains(high))
            .ok_or(TuningError::UnknownFrequencyRange { low, high })
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::NorthAmerica => write!(f, "north-america"),
            Region::Worldwide => write!(f, "worldwide"),
        }
    }
}
