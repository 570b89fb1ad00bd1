//! # Radio Stick Link
//!
//! Handles byte-level communication with the USB radio stick.
//!
//! This module handles:
//! - Finding the stick by USB vendor/product id (or an explicit path)
//! - Writing command bytes exactly as given
//! - Reading replies up to the zero-byte terminator, with a deadline
//! - Reinterpreting one-byte radio status replies as errors
//! - RSSI conversion of received packets

pub mod port_trait;
pub mod rssi;
pub mod stick;

use std::time::Duration;

use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::error::{RadioStatus, Result, TransportError};
use port_trait::{LinkIo, TokioSerialPort};

pub use stick::{ListenParams, RadioStick, ReceivedPacket};

/// Reply terminator appended by the stick firmware
pub const FRAME_TERMINATOR: u8 = 0x00;

/// Largest reply the stick produces (link header + encoded 64-byte fragment)
pub const MAX_REPLY_SIZE: usize = 256;

/// Read buffer size per port read
const READ_CHUNK: usize = 64;

/// Byte-oriented link to the radio stick
///
/// Owns the single device handle for the session.
pub struct LinkTransport<P: LinkIo = TokioSerialPort> {
    /// Port handle
    port: P,
    /// Device path (e.g., /dev/ttyACM0)
    device_path: String,
    /// Bytes read past a terminator, kept for the next reply
    carry: Vec<u8>,
}

impl<P: LinkIo> std::fmt::Debug for LinkTransport<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTransport")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl LinkTransport<TokioSerialPort> {
    /// Open the stick described by the configuration
    ///
    /// An explicit `port` wins; otherwise the first serial device whose USB
    /// vendor/product id appears in `usb_ids` is used.
    ///
    /// # Errors
    ///
    /// Returns error if no matching device exists or it cannot be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pumplink::config::LinkConfig;
    /// use pumplink::link::LinkTransport;
    ///
    /// fn main() -> anyhow::Result<()> {
    ///     let link = LinkTransport::open(&LinkConfig::default())?;
    ///     println!("Connected to: {}", link.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(config: &LinkConfig) -> Result<Self> {
        let path = if config.port.is_empty() {
            Self::discover(&config.usb_ids)?
        } else {
            config.port.clone()
        };

        let port = Self::open_port(&path, config.baud_rate)?;
        info!("Opened radio stick at {}", path);

        Ok(Self::with_port(TokioSerialPort::new(port), path))
    }

    /// Find the first serial device with a matching USB id
    fn discover(usb_ids: &[[u16; 2]]) -> Result<String> {
        let ports = tokio_serial::available_ports().map_err(|e| TransportError::Open {
            path: "<enumeration>".to_string(),
            reason: e.to_string(),
        })?;

        for port in ports {
            if let SerialPortType::UsbPort(usb) = &port.port_type {
                trace!("Found USB serial {} ({:04x}:{:04x})", port.port_name, usb.vid, usb.pid);
                if usb_ids.iter().any(|&[vid, pid]| vid == usb.vid && pid == usb.pid) {
                    debug!("Matched radio stick {:04x}:{:04x} at {}", usb.vid, usb.pid, port.port_name);
                    return Ok(port.port_name);
                }
            }
        }

        let tried = usb_ids
            .iter()
            .map(|[vid, pid]| format!("{:04x}:{:04x}", vid, pid))
            .collect::<Vec<_>>()
            .join(", ");
        Err(TransportError::DeviceNotFound(tried).into())
    }

    /// Open a specific serial port with 8N1 settings
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(port)
    }
}

impl<P: LinkIo> LinkTransport<P> {
    /// Wrap an already-open port
    pub fn with_port(port: P, device_path: impl Into<String>) -> Self {
        Self {
            port,
            device_path: device_path.into(),
            carry: Vec::new(),
        }
    }

    /// Get the device path of the opened port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Write exactly the given bytes
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes).await.map_err(TransportError::Io)?;
        self.port.flush().await.map_err(TransportError::Io)?;

        trace!("Wrote {} bytes: {:02X?}", bytes.len(), bytes);
        Ok(())
    }

    /// Read one reply
    ///
    /// Reads until the zero terminator (stripped) or until `timeout` elapses.
    /// A deadline with nothing read is [`TransportError::ReadTimeout`]; a
    /// deadline after a partial reply returns the partial bytes. A reply that
    /// is exactly one radio status code comes back as a [`RadioStatus`] error.
    ///
    /// # Arguments
    ///
    /// * `max_len` - Upper bound on the reply size
    /// * `timeout` - Deadline for the whole reply
    pub async fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let reply = self.read_until_terminator(max_len, timeout).await?;

        if let [code] = reply.as_slice() {
            if let Some(status) = RadioStatus::from_code(*code) {
                debug!("Stick reported {}", status);
                return Err(status.into());
            }
        }

        Ok(reply)
    }

    /// Read exactly `len` bytes with no terminator or status interpretation
    ///
    /// Used for replies whose bytes may legitimately be zero or collide
    /// with status codes (register values).
    pub async fn read_fixed(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut reply: Vec<u8> = self.carry.drain(..self.carry.len().min(len)).collect();
        let mut chunk = [0u8; READ_CHUNK];

        while reply.len() < len {
            let want = (len - reply.len()).min(READ_CHUNK);
            match self.read_chunk(&mut chunk[..want], deadline).await? {
                Some(n) => reply.extend_from_slice(&chunk[..n]),
                None if reply.is_empty() => {
                    return Err(TransportError::ReadTimeout {
                        waited_ms: timeout.as_millis() as u64,
                    }
                    .into())
                }
                None => return Err(TransportError::Interrupted.into()),
            }
        }

        Ok(reply)
    }

    async fn read_until_terminator(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut reply = Vec::with_capacity(max_len.min(MAX_REPLY_SIZE));
        let mut chunk = [0u8; READ_CHUNK];

        let mut pending = std::mem::take(&mut self.carry);
        loop {
            if let Some(end) = pending.iter().position(|&b| b == FRAME_TERMINATOR) {
                reply.extend_from_slice(&pending[..end]);
                self.carry = pending.split_off(end + 1);
                trace!("Read {} bytes: {:02X?}", reply.len(), reply);
                return Ok(reply);
            }
            reply.append(&mut pending);

            if reply.len() >= max_len {
                warn!("Reply reached {} bytes without a terminator", reply.len());
                return Ok(reply);
            }

            match self.read_chunk(&mut chunk, deadline).await? {
                Some(n) => pending.extend_from_slice(&chunk[..n]),
                None if reply.is_empty() => {
                    return Err(TransportError::ReadTimeout {
                        waited_ms: timeout.as_millis() as u64,
                    }
                    .into())
                }
                None => {
                    debug!("Deadline hit after {} bytes of an unterminated reply", reply.len());
                    return Ok(reply);
                }
            }
        }
    }

    /// One port read bounded by `deadline`; `None` when the deadline passed
    async fn read_chunk(&mut self, buf: &mut [u8], deadline: Instant) -> Result<Option<usize>> {
        match tokio::time::timeout_at(deadline, self.port.read(buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok(0)) => Err(TransportError::Interrupted.into()),
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Ok(Err(e)) => Err(TransportError::Io(e).into()),
        }
    }
}
