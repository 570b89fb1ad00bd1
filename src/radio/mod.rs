//! # Radio Tuning
//!
//! Carrier frequency control and the scan-and-optimize search for the channel
//! on which a particular pump answers best.

pub mod region;
pub mod tuner;

pub use region::Region;
pub use tuner::{RadioTuner, RegisterBus, RssiProbe, ScanPoint, ScanReport, ScanSettings};
