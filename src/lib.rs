//! # Pump Link Library
//!
//! Talk to a Medtronic-style insulin pump through a sub-GHz USB radio stick.
//!
//! This library provides the protocol stack from the serial port up to
//! typed pump commands: the stick's framing, the 4b6b symbol code and
//! packet CRCs, radio tuning and channel scanning, and the command engine
//! with its multi-fragment transfers and NAK recovery.

pub mod config;
pub mod error;
pub mod codec;
pub mod link;
pub mod radio;
pub mod command;
pub mod pump;

pub use config::Config;
pub use error::{PumpLinkError, Result};
pub use pump::Pump;
